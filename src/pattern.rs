use export_bus::{Frame, PixelFormat, exporter::FrameSource};

/// Moving color bars with a sweeping white column, RGBA.
pub struct TestPattern {
    width: u32,
    height: u32,
}

const BARS: [[u8; 3]; 7] = [
    [192, 192, 192],
    [192, 192, 0],
    [0, 192, 192],
    [0, 192, 0],
    [192, 0, 192],
    [192, 0, 0],
    [0, 0, 192],
];

impl TestPattern {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    fn draw(&self, index: u64) -> Vec<u8> {
        let (w, h) = (self.width as usize, self.height as usize);
        let mut data = vec![0u8; w * h * 4];
        let shift = index as usize * 4;
        let sweep = if w == 0 { 0 } else { (index as usize * 8) % w };
        for y in 0..h {
            for x in 0..w {
                let px = (y * w + x) * 4;
                let rgb = if x == sweep {
                    [255, 255, 255]
                } else {
                    BARS[((x + shift) * BARS.len() / w.max(1)) % BARS.len()]
                };
                data[px..px + 3].copy_from_slice(&rgb);
                data[px + 3] = 255;
            }
        }
        data
    }
}

impl FrameSource for TestPattern {
    fn render(&mut self, index: u64, timestamp_us: i64) -> anyhow::Result<Frame> {
        Ok(Frame::new(
            self.draw(index),
            self.width,
            self.height,
            PixelFormat::Rgba,
            timestamp_us,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frames_move() {
        let mut pattern = TestPattern::new(64, 8);
        let a = pattern.render(0, 0).unwrap();
        let b = pattern.render(1, 16_667).unwrap();
        assert_eq!(a.data().len(), 64 * 8 * 4);
        assert_eq!(b.timestamp(), 16_667);
        assert_ne!(a.data(), b.data());
    }
}
