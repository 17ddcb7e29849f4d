use std::panic;
use std::path::Path;

use anyhow::Result;
use plotters::coord::Shift;
use plotters::prelude::*;
use plotters::style::{FontDesc, FontFamily, FontStyle};
use plotters_backend::{
    text_anchor, BackendColor, BackendCoord, BackendStyle, BackendTextStyle, DrawingErrorKind,
    FontTransform,
};
use vx_curve::Decomposition;

pub enum ChartKind {
    Png,
    Svg,
}

const CHART_SIZE: (u32, u32) = (1280, 900);

/// Render a preview chart, turning backend panics into errors.
pub fn render_chart_guard(d: &Decomposition, path: &Path, kind: ChartKind) -> Result<(), String> {
    let render = || -> Result<(), String> {
        render_chart(d, path, kind).map_err(|e| format!("plotting error: {}", e))
    };

    panic::catch_unwind(panic::AssertUnwindSafe(render))
        .map_err(|_| "plotting backend panicked".to_string())?
}

fn render_chart(d: &Decomposition, path: &Path, kind: ChartKind) -> Result<()> {
    if d.is_empty() {
        return Ok(());
    }
    match kind {
        ChartKind::Png => {
            let backend = BitMapBackend::new(path, CHART_SIZE);
            let root = GlyphTextBackend::new(backend).into_drawing_area();
            draw_chart(root, d)
        }
        ChartKind::Svg => {
            let root = SVGBackend::new(path, CHART_SIZE).into_drawing_area();
            draw_chart(root, d)
        }
    }
}

/// Finite `(t, y)` runs; missing rows break the line.
fn segments(t: &[f64], y: &[f64]) -> Vec<Vec<(f64, f64)>> {
    let mut out = Vec::new();
    let mut current = Vec::new();
    for (&x, &v) in t.iter().zip(y.iter()) {
        if x.is_finite() && v.is_finite() {
            current.push((x, v));
        } else if !current.is_empty() {
            out.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

fn finite_range<'a, I>(values: I) -> Option<(f64, f64)>
where
    I: IntoIterator<Item = &'a f64>,
{
    let mut lo = f64::INFINITY;
    let mut hi = f64::NEG_INFINITY;
    for &v in values {
        if v.is_finite() {
            lo = lo.min(v);
            hi = hi.max(v);
        }
    }
    if lo > hi {
        return None;
    }
    if (hi - lo).abs() < f64::EPSILON {
        return Some((lo - 1.0, hi + 1.0));
    }
    let pad = (hi - lo) * 0.05;
    Some((lo - pad, hi + pad))
}

fn draw_chart<DB>(root: DrawingArea<DB, Shift>, d: &Decomposition) -> Result<()>
where
    DB: DrawingBackend,
    DB::ErrorType: 'static,
{
    root.fill(&WHITE)?;
    let (upper, lower) = root.split_vertically((CHART_SIZE.1 * 3 / 5) as i32);

    let Some(x_range) = finite_range(d.independent.iter()) else {
        return Ok(());
    };
    let y_range = finite_range(d.raw.iter().chain(d.smooth.iter())).unwrap_or((0.0, 1.0));
    let r_range = finite_range(d.residual.iter()).unwrap_or((-1.0, 1.0));

    let axis_font = FontDesc::new(FontFamily::SansSerif, 18.0, FontStyle::Normal);
    let raw_color = RGBColor(160, 160, 160);
    let smooth_color = RGBColor(200, 0, 100);
    let residual_color = RGBColor(30, 144, 255);

    let mut top = ChartBuilder::on(&upper)
        .margin(20)
        .set_label_area_size(LabelAreaPosition::Left, 70)
        .set_label_area_size(LabelAreaPosition::Bottom, 40)
        .build_cartesian_2d(x_range.0..x_range.1, y_range.0..y_range.1)?;
    top.configure_mesh()
        .light_line_style(&TRANSPARENT)
        .y_desc("V")
        .label_style(axis_font.clone().color(&BLACK.mix(0.85)))
        .draw()?;

    for (idx, run) in segments(&d.independent, &d.raw).into_iter().enumerate() {
        let mut series = top.draw_series(LineSeries::new(run, &raw_color))?;
        if idx == 0 {
            series
                .label("Raw")
                .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 30, y)], raw_color));
        }
    }
    let smooth_style = ShapeStyle {
        color: smooth_color.to_rgba(),
        filled: false,
        stroke_width: 2,
    };
    for (idx, run) in segments(&d.independent, &d.smooth).into_iter().enumerate() {
        let mut series = top.draw_series(LineSeries::new(run, smooth_style))?;
        if idx == 0 {
            series
                .label("Smooth")
                .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 30, y)], smooth_color));
        }
    }
    top.configure_series_labels()
        .background_style(&WHITE.mix(0.7))
        .border_style(&BLACK.mix(0.3))
        .label_font(axis_font.clone().color(&BLACK))
        .position(SeriesLabelPosition::UpperLeft)
        .draw()?;

    let mut bottom = ChartBuilder::on(&lower)
        .margin(20)
        .set_label_area_size(LabelAreaPosition::Left, 70)
        .set_label_area_size(LabelAreaPosition::Bottom, 40)
        .build_cartesian_2d(x_range.0..x_range.1, r_range.0..r_range.1)?;
    bottom
        .configure_mesh()
        .light_line_style(&TRANSPARENT)
        .x_desc("T")
        .y_desc("Residual")
        .label_style(axis_font.color(&BLACK.mix(0.85)))
        .draw()?;
    for run in segments(&d.independent, &d.residual) {
        bottom.draw_series(LineSeries::new(run, &residual_color))?;
    }

    root.present()?;
    Ok(())
}

/// Backend wrapper that rasterizes text from a built-in bitmap font.
///
/// `plotters` is built without a font engine, so the bitmap backend cannot
/// draw text on its own. Everything except text goes straight to `inner`.
struct GlyphTextBackend<DB> {
    inner: DB,
}

impl<DB> GlyphTextBackend<DB> {
    fn new(inner: DB) -> Self {
        Self { inner }
    }
}

impl<DB: DrawingBackend> DrawingBackend for GlyphTextBackend<DB> {
    type ErrorType = DB::ErrorType;

    fn get_size(&self) -> (u32, u32) {
        self.inner.get_size()
    }

    fn ensure_prepared(&mut self) -> Result<(), DrawingErrorKind<Self::ErrorType>> {
        self.inner.ensure_prepared()
    }

    fn present(&mut self) -> Result<(), DrawingErrorKind<Self::ErrorType>> {
        self.inner.present()
    }

    fn draw_pixel(
        &mut self,
        point: BackendCoord,
        color: BackendColor,
    ) -> Result<(), DrawingErrorKind<Self::ErrorType>> {
        self.inner.draw_pixel(point, color)
    }

    fn draw_line<S: BackendStyle>(
        &mut self,
        from: BackendCoord,
        to: BackendCoord,
        style: &S,
    ) -> Result<(), DrawingErrorKind<Self::ErrorType>> {
        self.inner.draw_line(from, to, style)
    }

    fn draw_rect<S: BackendStyle>(
        &mut self,
        upper_left: BackendCoord,
        bottom_right: BackendCoord,
        style: &S,
        fill: bool,
    ) -> Result<(), DrawingErrorKind<Self::ErrorType>> {
        self.inner.draw_rect(upper_left, bottom_right, style, fill)
    }

    fn draw_path<S: BackendStyle, I: IntoIterator<Item = BackendCoord>>(
        &mut self,
        path: I,
        style: &S,
    ) -> Result<(), DrawingErrorKind<Self::ErrorType>> {
        self.inner.draw_path(path, style)
    }

    fn draw_circle<S: BackendStyle>(
        &mut self,
        center: BackendCoord,
        radius: u32,
        style: &S,
        fill: bool,
    ) -> Result<(), DrawingErrorKind<Self::ErrorType>> {
        self.inner.draw_circle(center, radius, style, fill)
    }

    fn fill_polygon<S: BackendStyle, I: IntoIterator<Item = BackendCoord>>(
        &mut self,
        vert: I,
        style: &S,
    ) -> Result<(), DrawingErrorKind<Self::ErrorType>> {
        self.inner.fill_polygon(vert, style)
    }

    fn blit_bitmap(
        &mut self,
        pos: BackendCoord,
        (iw, ih): (u32, u32),
        src: &[u8],
    ) -> Result<(), DrawingErrorKind<Self::ErrorType>> {
        self.inner.blit_bitmap(pos, (iw, ih), src)
    }

    fn draw_text<TStyle: BackendTextStyle>(
        &mut self,
        text: &str,
        style: &TStyle,
        pos: BackendCoord,
    ) -> Result<(), DrawingErrorKind<Self::ErrorType>> {
        let color = style.color();
        if color.alpha == 0.0 || text.trim().is_empty() {
            return Ok(());
        }

        let scale = glyph_scale(style.size());
        let (width, height) = text_extent(text, scale);
        let (width, height) = (width as i32, height as i32);
        let dx = match style.anchor().h_pos {
            text_anchor::HPos::Left => 0,
            text_anchor::HPos::Right => -width,
            text_anchor::HPos::Center => -width / 2,
        };
        let dy = match style.anchor().v_pos {
            text_anchor::VPos::Top => 0,
            text_anchor::VPos::Center => -height / 2,
            text_anchor::VPos::Bottom => -height,
        };
        let transform = style.transform();

        let mut cursor = dx;
        for ch in text.chars() {
            let Some((glyph_width, rows)) = glyph(ch) else {
                cursor += scale * GLYPH_SPACE_WIDTH;
                continue;
            };
            for (row, pattern) in rows.iter().enumerate() {
                for col in 0..glyph_width {
                    if pattern & (1 << (glyph_width - 1 - col)) == 0 {
                        continue;
                    }
                    let u = cursor + col * scale;
                    let v = dy + row as i32 * scale;
                    for su in 0..scale {
                        for sv in 0..scale {
                            let point = place(pos, (u + su, v + sv), &transform);
                            self.inner.draw_pixel(point, color)?;
                        }
                    }
                }
            }
            cursor += scale * (glyph_width + 1);
        }
        Ok(())
    }

    fn estimate_text_size<TStyle: BackendTextStyle>(
        &self,
        text: &str,
        style: &TStyle,
    ) -> Result<(u32, u32), DrawingErrorKind<Self::ErrorType>> {
        Ok(text_extent(text, glyph_scale(style.size())))
    }
}

const GLYPH_HEIGHT: i32 = 7;
const GLYPH_SPACE_WIDTH: i32 = 3;

/// Whole-pixel magnification of the 7-row font for a requested font size.
fn glyph_scale(size: f64) -> i32 {
    (size / 8.0).round().max(1.0) as i32
}

/// Width and height in pixels of `text` drawn at `scale`.
fn text_extent(text: &str, scale: i32) -> (u32, u32) {
    let width: i32 = text
        .chars()
        .map(|ch| match glyph(ch) {
            Some((w, _)) => w + 1,
            None => GLYPH_SPACE_WIDTH,
        })
        .sum();
    ((width * scale).max(0) as u32, (GLYPH_HEIGHT * scale) as u32)
}

/// Offset `(u, v)` in the text's own frame, rotated into backend coordinates.
fn place(pos: BackendCoord, (u, v): (i32, i32), transform: &FontTransform) -> BackendCoord {
    match transform {
        FontTransform::None => (pos.0 + u, pos.1 + v),
        FontTransform::Rotate90 => (pos.0 - v, pos.1 + u),
        FontTransform::Rotate180 => (pos.0 - u, pos.1 - v),
        FontTransform::Rotate270 => (pos.0 + v, pos.1 - u),
    }
}

/// Glyph width and row bitmaps (most significant used bit on the left).
///
/// Covers digits, number punctuation and the letters of the chart labels;
/// lowercase letters render as uppercase.
fn glyph(ch: char) -> Option<(i32, [u8; 7])> {
    let rows = match ch.to_ascii_uppercase() {
        '0' => [0b01110, 0b10001, 0b10011, 0b10101, 0b11001, 0b10001, 0b01110],
        '1' => return Some((3, [0b010, 0b110, 0b010, 0b010, 0b010, 0b010, 0b111])),
        '2' => [0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b01000, 0b11111],
        '3' => [0b11110, 0b00001, 0b00001, 0b00110, 0b00001, 0b00001, 0b11110],
        '4' => [0b00010, 0b00110, 0b01010, 0b10010, 0b11111, 0b00010, 0b00010],
        '5' => [0b11111, 0b10000, 0b11110, 0b00001, 0b00001, 0b10001, 0b01110],
        '6' => [0b01110, 0b10001, 0b10000, 0b11110, 0b10001, 0b10001, 0b01110],
        '7' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b01000, 0b01000],
        '8' => [0b01110, 0b10001, 0b10001, 0b01110, 0b10001, 0b10001, 0b01110],
        '9' => [0b01110, 0b10001, 0b10001, 0b01111, 0b00001, 0b10001, 0b01110],
        '.' => return Some((1, [0, 0, 0, 0, 0, 0, 1])),
        '-' => return Some((3, [0, 0, 0, 0b111, 0, 0, 0])),
        '+' => return Some((3, [0, 0, 0b010, 0b111, 0b010, 0, 0])),
        'A' => [0b01110, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'D' => [0b11100, 0b10010, 0b10001, 0b10001, 0b10001, 0b10010, 0b11100],
        'E' => [0b11111, 0b10000, 0b10000, 0b11110, 0b10000, 0b10000, 0b11111],
        'H' => [0b10001, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'I' => return Some((3, [0b111, 0b010, 0b010, 0b010, 0b010, 0b010, 0b111])),
        'L' => [0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b11111],
        'M' => [0b10001, 0b11011, 0b10101, 0b10001, 0b10001, 0b10001, 0b10001],
        'O' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'R' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10100, 0b10010, 0b10001],
        'S' => [0b01111, 0b10000, 0b10000, 0b01110, 0b00001, 0b00001, 0b11110],
        'T' => [0b11111, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100],
        'U' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'V' => [0b10001, 0b10001, 0b10001, 0b10001, 0b01010, 0b01010, 0b00100],
        'W' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10101, 0b11011, 0b10001],
        _ => return None,
    };
    Some((5, rows))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segments_split_on_missing() {
        let t = [0.0, 1.0, f64::NAN, 3.0, 4.0];
        let y = [0.0, 1.0, 2.0, 3.0, f64::NAN];
        let runs = segments(&t, &y);
        assert_eq!(runs, vec![vec![(0.0, 0.0), (1.0, 1.0)], vec![(3.0, 3.0)]]);
    }

    #[test]
    fn test_finite_range_pads_and_handles_flat() {
        let (lo, hi) = finite_range([0.0, f64::NAN, 10.0].iter()).unwrap();
        assert!(lo < 0.0 && hi > 10.0);
        assert_eq!(finite_range([2.0, 2.0].iter()), Some((1.0, 3.0)));
        assert_eq!(finite_range([f64::NAN].iter()), None);
    }

    #[test]
    fn test_text_extent_uses_glyph_widths() {
        // R, A, W are 5 wide plus one column of spacing each.
        assert_eq!(text_extent("Raw", 1), (18, 7));
        assert_eq!(text_extent("1.5", 2), (2 * (4 + 2 + 6), 14));
        assert_eq!(glyph_scale(18.0), 2);
        assert!(glyph('?').is_none());
    }

    #[test]
    fn test_rotated_text_runs_upward() {
        assert_eq!(place((10, 10), (3, 1), &FontTransform::None), (13, 11));
        assert_eq!(place((10, 10), (3, 1), &FontTransform::Rotate270), (11, 7));
    }

    #[test]
    fn test_png_and_svg_render() {
        let dir = tempfile::tempdir().unwrap();
        let t: Vec<f64> = (0..10).map(|i| i as f64).collect();
        let v: Vec<f64> = t.iter().map(|x| (x * 1.3) % 3.0).collect();
        let d = vx_curve::decompose(&t, &v, &vx_curve::Params::new(3.0)).unwrap();

        let png = dir.path().join("chart.png");
        assert_eq!(render_chart_guard(&d, &png, ChartKind::Png), Ok(()));
        assert!(std::fs::metadata(&png).unwrap().len() > 0);

        let svg = dir.path().join("chart.svg");
        assert_eq!(render_chart_guard(&d, &svg, ChartKind::Svg), Ok(()));
        let text = std::fs::read_to_string(&svg).unwrap();
        assert!(text.contains("Smooth"));
    }
}
