// display.rs
//! Screen layout and partial redraw.
//!
//! The screen is split into four regions computed once from the font
//! metrics: min and max in the top row, the big current temperature in
//! the middle and the info overlay at the bottom. Only the region whose
//! value changed is cleared and repainted, which keeps the slow SPI
//! display from flickering.

use std::convert::Infallible;

use embedded_graphics::{
    mono_font::{MonoFont, MonoTextStyle},
    pixelcolor::Rgb565,
    prelude::*,
    primitives::{Line, PrimitiveStyle, Rectangle},
    text::{Alignment, Baseline, Text, TextStyleBuilder},
};
use profont::{PROFONT_12_POINT, PROFONT_18_POINT, PROFONT_24_POINT};

use crate::*;

pub const SCREEN_WIDTH: u16 = 320;
pub const SCREEN_HEIGHT: u16 = 240;

pub const BACKGROUND: Rgb565 = Rgb565::BLACK;
pub const FOREGROUND: Rgb565 = Rgb565::WHITE;
pub const LABEL_COLOR: Rgb565 = Rgb565::YELLOW;
pub const SEPARATOR_COLOR: Rgb565 = Rgb565::BLUE;

pub const LABEL_FONT: &MonoFont<'static> = &PROFONT_18_POINT;
pub const VALUE_FONT: &MonoFont<'static> = &PROFONT_24_POINT;
pub const INFO_FONT: &MonoFont<'static> = &PROFONT_12_POINT;

const MIN_LABEL: &str = "Min:";
const MAX_LABEL: &str = "Max:";
const EXTREME_WIDTH: &str = "000";
const UNIT_LABEL: &str = "°C";

/// The vertical metrics of a monospace font, in pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FontMetrics {
    pub ascent: u16,
    pub descent: u16,
    pub advance: u16,
}

impl FontMetrics {
    pub fn of(font: &MonoFont<'_>) -> Self {
        FontMetrics {
            ascent: font.baseline as u16,
            descent: font.character_size.height.saturating_sub(font.baseline) as u16,
            advance: (font.character_size.width + font.character_spacing) as u16,
        }
    }

    pub fn line_height(&self) -> u16 {
        self.ascent + self.descent
    }

    pub fn text_width(&self, text: &str) -> u16 {
        text.chars().count() as u16 * self.advance
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScreenRegion {
    pub x: u16,
    pub y: u16,
    pub width: u16,
    pub height: u16,
}

impl ScreenRegion {
    pub fn new(x: u16, y: u16, width: u16, height: u16) -> Self {
        ScreenRegion {
            x,
            y,
            width,
            height,
        }
    }

    pub fn right(&self) -> u16 {
        self.x + self.width
    }

    pub fn bottom(&self) -> u16 {
        self.y + self.height
    }

    pub fn overlaps(&self, other: &ScreenRegion) -> bool {
        self.x < other.right()
            && other.x < self.right()
            && self.y < other.bottom()
            && other.y < self.bottom()
    }

    pub fn rect(&self) -> Rectangle {
        Rectangle::new(
            Point::new(self.x.into(), self.y.into()),
            Size::new(self.width.into(), self.height.into()),
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Region {
    Min,
    Max,
    Temperature,
    Info,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Layout {
    pub width: u16,
    pub height: u16,
    pub label_baseline: u16,
    pub separator_y: u16,
    pub unit_x: u16,
    pub value_baseline: u16,
    pub bottom_line_y: u16,
    pub min_box: ScreenRegion,
    pub max_box: ScreenRegion,
    pub temp_box: ScreenRegion,
    pub info_box: ScreenRegion,
}

impl Layout {
    pub fn compute(width: u16, height: u16, label: FontMetrics, value: FontMetrics) -> Self {
        let label_baseline = label.line_height() + 10;
        let separator_y = label_baseline + 10;
        let extreme_w = label.text_width(EXTREME_WIDTH);
        let extreme_h = separator_y.saturating_sub(7);

        let min_box = ScreenRegion::new(label.text_width(MIN_LABEL), 0, extreme_w, extreme_h);
        let max_box = ScreenRegion::new(
            width / 2 + 5 + label.text_width(MAX_LABEL),
            0,
            extreme_w,
            extreme_h,
        );

        let unit_x = width.saturating_sub(value.text_width(UNIT_LABEL) + 25);
        let value_baseline = separator_y + value.line_height() + 30;
        let temp_top = separator_y + 10;
        let temp_box = ScreenRegion::new(0, temp_top, unit_x, value_baseline - temp_top);

        let bottom_line_y = value_baseline + 15;
        let info_top = (bottom_line_y + 1).min(height);
        let info_box = ScreenRegion::new(0, info_top, width, height - info_top);

        Layout {
            width,
            height,
            label_baseline,
            separator_y,
            unit_x,
            value_baseline,
            bottom_line_y,
            min_box,
            max_box,
            temp_box,
            info_box,
        }
    }

    pub fn with_default_fonts(width: u16, height: u16) -> Self {
        Self::compute(
            width,
            height,
            FontMetrics::of(LABEL_FONT),
            FontMetrics::of(VALUE_FONT),
        )
    }

    pub fn region(&self, region: Region) -> ScreenRegion {
        match region {
            Region::Min => self.min_box,
            Region::Max => self.max_box,
            Region::Temperature => self.temp_box,
            Region::Info => self.info_box,
        }
    }
}

/// Format the big temperature so that it never overflows its box.
///
/// The number of decimals shrinks as the integer part grows:
/// `5.00`, `42.3`, `105`, `-15.0` and `-3`.
pub fn format_temperature(value: f32) -> String {
    if value > 0.0 && value < 10.0 {
        format!("{value:.2}")
    } else if value >= 10.0 {
        if value < 100.0 {
            format!("{value:.1}")
        } else {
            format!("{value:.0}")
        }
    } else if value < -10.0 {
        format!("{value:.1}")
    } else if value >= -10.0 {
        format!("{value:2.0}")
    } else {
        // NaN
        format!("{value:3.0}")
    }
}

/// Min and max are shown as whole degrees, truncated.
pub fn format_extreme(value: f32) -> String {
    format!("{:3}", value as i16)
}

/// Everything the info overlay shows.
#[derive(Clone, Debug, PartialEq)]
pub struct InfoFields {
    pub net: NetInfo,
    pub portal: PortalState,
    /// `None` when MQTT is not configured.
    pub mqtt: Option<MqttState>,
}

impl InfoFields {
    pub fn lines(&self) -> Vec<String> {
        let mut lines = vec![
            format!("MAC : {}", self.net.mac_string()),
            format!("IP : {}", self.net.ip),
            format!("Mask : {}", self.net.mask),
            format!("Gateway : {}", self.net.gateway),
            format!("Status : {}", self.portal),
        ];
        if let Some(m) = self.mqtt {
            lines.push(format!("MQTT state : {m}"));
        }
        lines
    }
}

pub struct Painter<D> {
    display: D,
    layout: Layout,
}

impl<D> Painter<D>
where
    D: DrawTarget<Color = Rgb565>,
{
    /// Compute the layout for the display's size. Nothing is drawn yet.
    pub fn new(display: D) -> Self {
        let size = display.bounding_box().size;
        let layout = Layout::with_default_fonts(size.width as u16, size.height as u16);
        Painter { display, layout }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn display(&self) -> &D {
        &self.display
    }

    pub fn display_mut(&mut self) -> &mut D {
        &mut self.display
    }

    /// Clear the screen and draw the static parts: separators and labels.
    pub fn draw_chrome(&mut self) {
        let l = self.layout;
        self.display.clear(BACKGROUND).ok();

        let sep = PrimitiveStyle::with_stroke(SEPARATOR_COLOR, 1);
        let w = i32::from(l.width);
        Line::new(
            Point::new(0, l.separator_y.into()),
            Point::new(w - 1, l.separator_y.into()),
        )
        .into_styled(sep)
        .draw(&mut self.display)
        .ok();
        Line::new(
            Point::new(w / 2, 0),
            Point::new(w / 2, l.separator_y.into()),
        )
        .into_styled(sep)
        .draw(&mut self.display)
        .ok();
        Line::new(
            Point::new(0, l.bottom_line_y.into()),
            Point::new(w - 1, l.bottom_line_y.into()),
        )
        .into_styled(sep)
        .draw(&mut self.display)
        .ok();

        let label = MonoTextStyle::new(LABEL_FONT, LABEL_COLOR);
        Text::with_baseline(
            MIN_LABEL,
            Point::new(0, l.label_baseline.into()),
            label,
            Baseline::Alphabetic,
        )
        .draw(&mut self.display)
        .ok();
        Text::with_baseline(
            MAX_LABEL,
            Point::new(w / 2 + 5, l.label_baseline.into()),
            label,
            Baseline::Alphabetic,
        )
        .draw(&mut self.display)
        .ok();
        Text::with_baseline(
            UNIT_LABEL,
            Point::new(l.unit_x.into(), l.value_baseline.into()),
            MonoTextStyle::new(VALUE_FONT, LABEL_COLOR),
            Baseline::Alphabetic,
        )
        .draw(&mut self.display)
        .ok();
    }

    /// Clear one region and draw `text` into it.
    ///
    /// The temperature is right-aligned against the unit label, min and
    /// max are left-aligned after their labels.
    pub fn redraw(&mut self, region: Region, text: &str) {
        let r = self.layout.region(region);
        self.clear(&r);
        if text.is_empty() {
            return;
        }

        let (font, anchor, alignment) = match region {
            // right-aligned text ends on the anchor column, keep it inside the box
            Region::Temperature => (
                VALUE_FONT,
                Point::new(i32::from(r.right()) - 1, r.bottom().into()),
                Alignment::Right,
            ),
            Region::Min | Region::Max => (
                LABEL_FONT,
                Point::new(r.x.into(), self.layout.label_baseline.into()),
                Alignment::Left,
            ),
            Region::Info => (
                INFO_FONT,
                Point::new(r.x.into(), i32::from(r.y) + 5),
                Alignment::Left,
            ),
        };
        let baseline = match region {
            Region::Info => Baseline::Top,
            _ => Baseline::Alphabetic,
        };
        let style = TextStyleBuilder::new()
            .alignment(alignment)
            .baseline(baseline)
            .build();

        Text::with_text_style(text, anchor, MonoTextStyle::new(font, FOREGROUND), style)
            .draw(&mut self.display)
            .ok();
    }

    pub fn show_temperature(&mut self, value: f32) {
        self.redraw(Region::Temperature, &format_temperature(value));
    }

    pub fn show_min(&mut self, value: f32) {
        self.redraw(Region::Min, &format_extreme(value));
    }

    pub fn show_max(&mut self, value: f32) {
        self.redraw(Region::Max, &format_extreme(value));
    }

    pub fn render_info_overlay(&mut self, visible: bool, fields: &InfoFields) {
        if visible {
            self.redraw(Region::Info, &fields.lines().join("\n"));
        } else {
            let r = self.layout.info_box;
            self.clear(&r);
        }
    }

    fn clear(&mut self, r: &ScreenRegion) {
        r.rect()
            .into_styled(PrimitiveStyle::with_fill(BACKGROUND))
            .draw(&mut self.display)
            .ok();
    }
}

/// A plain in-memory RGB565 framebuffer.
pub struct FrameBuffer {
    size: Size,
    pixels: Vec<Rgb565>,
}

impl FrameBuffer {
    pub fn new(width: u16, height: u16) -> Self {
        FrameBuffer {
            size: Size::new(width.into(), height.into()),
            pixels: vec![BACKGROUND; usize::from(width) * usize::from(height)],
        }
    }

    pub fn pixel(&self, x: u16, y: u16) -> Option<Rgb565> {
        if u32::from(x) >= self.size.width || u32::from(y) >= self.size.height {
            return None;
        }
        self.pixels
            .get(usize::from(y) * self.size.width as usize + usize::from(x))
            .copied()
    }

    pub fn pixels(&self) -> &[Rgb565] {
        &self.pixels
    }
}

impl OriginDimensions for FrameBuffer {
    fn size(&self) -> Size {
        self.size
    }
}

impl DrawTarget for FrameBuffer {
    type Color = Rgb565;
    type Error = Infallible;

    fn draw_iter<I>(&mut self, pixels: I) -> Result<(), Self::Error>
    where
        I: IntoIterator<Item = Pixel<Self::Color>>,
    {
        let (w, h) = (self.size.width as i32, self.size.height as i32);
        for Pixel(p, color) in pixels {
            if p.x >= 0 && p.x < w && p.y >= 0 && p.y < h {
                self.pixels[(p.y * w + p.x) as usize] = color;
            }
        }
        Ok(())
    }
}


// EOF
