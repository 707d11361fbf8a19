use serde::{Deserialize, Serialize};

/// An integer pixel coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Point {
    pub x: i64,
    pub y: i64,
}

impl Point {
    pub fn new(x: i64, y: i64) -> Self {
        Self { x, y }
    }
}

/// One stroke submitted by a client. `is_drawing == false` erases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Path {
    pub points: Vec<Point>,
    pub stroke_width: u32,
    pub is_drawing: bool,
}

/// Boolean raster stored row-major. Writes outside the bounds are dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmap {
    width: usize,
    height: usize,
    pixels: Vec<bool>,
}

impl Bitmap {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            pixels: vec![false; width * height],
        }
    }

    /// Wrap an existing buffer. Returns `None` if the length doesn't match.
    pub fn from_pixels(width: usize, height: usize, pixels: Vec<bool>) -> Option<Self> {
        (pixels.len() == width * height).then_some(Self {
            width,
            height,
            pixels,
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn pixels(&self) -> &[bool] {
        &self.pixels
    }

    pub fn get(&self, x: i64, y: i64) -> Option<bool> {
        self.index(x, y).map(|i| self.pixels[i])
    }

    pub fn set(&mut self, x: i64, y: i64, value: bool) {
        if let Some(i) = self.index(x, y) {
            self.pixels[i] = value;
        }
    }

    pub fn clear(&mut self) {
        self.pixels.fill(false);
    }

    fn index(&self, x: i64, y: i64) -> Option<usize> {
        if x < 0 || y < 0 {
            return None;
        }
        let (x, y) = (x as usize, y as usize);
        (x < self.width && y < self.height).then(|| y * self.width + x)
    }
}

/// Rasterise one path into `bitmap`. Points are in the bitmap's coordinates.
pub fn rasterize_path(bitmap: &mut Bitmap, path: &Path) {
    let radius = i64::from(path.stroke_width / 2);
    let value = path.is_drawing;

    match path.points.as_slice() {
        [] => {}
        [p] => {
            if path.stroke_width > 1 {
                fill_disc(bitmap, *p, radius, value);
            } else {
                bitmap.set(p.x, p.y, value);
            }
        }
        points => {
            for pair in points.windows(2) {
                draw_segment(bitmap, pair[0], pair[1], path.stroke_width, value);
            }
        }
    }
}

/// Rasterise every path in order; later paths overwrite earlier ones.
pub fn rasterize_paths(bitmap: &mut Bitmap, paths: &[Path]) {
    for path in paths {
        rasterize_path(bitmap, path);
    }
}

fn draw_segment(bitmap: &mut Bitmap, p1: Point, p2: Point, stroke_width: u32, value: bool) {
    if stroke_width <= 1 {
        bresenham(bitmap, p1, p2, value);
        return;
    }

    let radius = i64::from(stroke_width / 2);
    fill_disc(bitmap, p1, radius, value);
    fill_disc(bitmap, p2, radius, value);

    let dx = (p2.x - p1.x) as f64;
    let dy = (p2.y - p1.y) as f64;
    let len = (dx * dx + dy * dy).sqrt();
    if len == 0.0 {
        return;
    }
    let (nx, ny) = (-dy / len, dx / len);

    for offset in -radius..=radius {
        let ox = (nx * offset as f64).round() as i64;
        let oy = (ny * offset as f64).round() as i64;
        bresenham(
            bitmap,
            Point::new(p1.x + ox, p1.y + oy),
            Point::new(p2.x + ox, p2.y + oy),
            value,
        );
    }
}

/// Scanline fill of every pixel with `x² + y² <= r²` around `center`.
fn fill_disc(bitmap: &mut Bitmap, center: Point, radius: i64, value: bool) {
    let r2 = radius * radius;
    for dy in -radius..=radius {
        for dx in -radius..=radius {
            if dx * dx + dy * dy <= r2 {
                bitmap.set(center.x + dx, center.y + dy, value);
            }
        }
    }
}

fn bresenham(bitmap: &mut Bitmap, from: Point, to: Point, value: bool) {
    let (mut x, mut y) = (from.x, from.y);
    let dx = (to.x - from.x).abs();
    let dy = -(to.y - from.y).abs();
    let sx = if from.x < to.x { 1 } else { -1 };
    let sy = if from.y < to.y { 1 } else { -1 };
    let mut err = dx + dy;

    loop {
        bitmap.set(x, y, value);
        if x == to.x && y == to.y {
            break;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            x += sx;
        }
        if e2 <= dx {
            err += dx;
            y += sy;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(points: &[(i64, i64)], stroke_width: u32, is_drawing: bool) -> Path {
        Path {
            points: points.iter().map(|&(x, y)| Point::new(x, y)).collect(),
            stroke_width,
            is_drawing,
        }
    }

    fn painted(bitmap: &Bitmap) -> usize {
        bitmap.pixels().iter().filter(|&&p| p).count()
    }

    #[test]
    fn test_horizontal_line() {
        let mut bitmap = Bitmap::new(10, 10);
        rasterize_path(&mut bitmap, &path(&[(0, 0), (3, 0)], 1, true));
        for x in 0..4 {
            assert_eq!(bitmap.get(x, 0), Some(true));
        }
        assert_eq!(bitmap.get(4, 0), Some(false));
        assert_eq!(painted(&bitmap), 4);
    }

    #[test]
    fn test_diagonal_line_hits_both_endpoints() {
        let mut bitmap = Bitmap::new(10, 10);
        rasterize_path(&mut bitmap, &path(&[(0, 0), (5, 5)], 1, true));
        for i in 0..6 {
            assert_eq!(bitmap.get(i, i), Some(true));
        }
        assert_eq!(painted(&bitmap), 6);
    }

    #[test]
    fn test_steep_reverse_line() {
        let mut bitmap = Bitmap::new(10, 10);
        rasterize_path(&mut bitmap, &path(&[(2, 9), (1, 0)], 1, true));
        assert_eq!(bitmap.get(2, 9), Some(true));
        assert_eq!(bitmap.get(1, 0), Some(true));
        // One pixel per row for a steep line.
        assert_eq!(painted(&bitmap), 10);
    }

    #[test]
    fn test_empty_path_is_noop() {
        let mut bitmap = Bitmap::new(4, 4);
        bitmap.set(1, 1, true);
        let before = bitmap.clone();
        rasterize_path(&mut bitmap, &path(&[], 5, true));
        rasterize_paths(&mut bitmap, &[]);
        assert_eq!(bitmap, before);
    }

    #[test]
    fn test_single_point_stamps_dot() {
        let mut bitmap = Bitmap::new(10, 10);
        rasterize_path(&mut bitmap, &path(&[(5, 5)], 1, true));
        assert_eq!(painted(&bitmap), 1);

        let mut bitmap = Bitmap::new(10, 10);
        rasterize_path(&mut bitmap, &path(&[(5, 5)], 3, true));
        // Radius 1 disc: centre plus four neighbours.
        assert_eq!(painted(&bitmap), 5);
    }

    #[test]
    fn test_thick_line_covers_band() {
        let mut bitmap = Bitmap::new(20, 20);
        rasterize_path(&mut bitmap, &path(&[(5, 10), (15, 10)], 5, true));
        for x in 5..=15 {
            for y in 8..=12 {
                assert_eq!(bitmap.get(x, y), Some(true), "({x},{y}) should be painted");
            }
        }
        assert_eq!(bitmap.get(10, 7), Some(false));
        assert_eq!(bitmap.get(10, 13), Some(false));
    }

    #[test]
    fn test_erase_clears_pixels() {
        let mut bitmap = Bitmap::new(10, 10);
        rasterize_path(&mut bitmap, &path(&[(0, 0), (9, 0)], 1, true));
        rasterize_path(&mut bitmap, &path(&[(0, 0), (4, 0)], 1, false));
        assert_eq!(bitmap.get(4, 0), Some(false));
        assert_eq!(bitmap.get(5, 0), Some(true));
        assert_eq!(painted(&bitmap), 5);
    }

    #[test]
    fn test_out_of_bounds_is_clipped() {
        let mut bitmap = Bitmap::new(5, 5);
        rasterize_path(&mut bitmap, &path(&[(-3, 2), (10, 2)], 1, true));
        assert_eq!(painted(&bitmap), 5);
        rasterize_path(&mut bitmap, &path(&[(-10, -10), (-5, -5)], 7, true));
        assert_eq!(painted(&bitmap), 5);
    }

    #[test]
    fn test_from_pixels_checks_length() {
        assert!(Bitmap::from_pixels(3, 3, vec![false; 9]).is_some());
        assert!(Bitmap::from_pixels(3, 3, vec![false; 8]).is_none());
    }

    #[test]
    fn test_path_wire_format() {
        let p: Path = serde_json::from_str(
            r#"{"points":[{"x":0,"y":0},{"x":3,"y":0}],"strokeWidth":1,"isDrawing":true}"#,
        )
        .unwrap();
        assert_eq!(p, path(&[(0, 0), (3, 0)], 1, true));
    }
}
