/// Geometry for scaling a picture to cover a target size, then cropping the
/// overflow equally from both sides.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AspectFill {
    pub scaled_width: u32,
    pub scaled_height: u32,
    pub crop_x: u32,
    pub crop_y: u32,
}

impl AspectFill {
    pub fn compute(src_w: u32, src_h: u32, dst_w: u32, dst_h: u32) -> Self {
        if src_w == 0 || src_h == 0 || dst_w == 0 || dst_h == 0 {
            return Self {
                scaled_width: dst_w,
                scaled_height: dst_h,
                crop_x: 0,
                crop_y: 0,
            };
        }

        let scale = f64::max(
            dst_w as f64 / src_w as f64,
            dst_h as f64 / src_h as f64,
        );
        // Even sizes keep the 4:2:0 chroma planes aligned with the crop.
        let scaled_width = even_at_least((src_w as f64 * scale).ceil() as u32, dst_w);
        let scaled_height = even_at_least((src_h as f64 * scale).ceil() as u32, dst_h);

        Self {
            scaled_width,
            scaled_height,
            crop_x: ((scaled_width - dst_w) / 2) & !1,
            crop_y: ((scaled_height - dst_h) / 2) & !1,
        }
    }
}

fn even_at_least(value: u32, min: u32) -> u32 {
    let v = value.max(min);
    if v % 2 == 1 && v > min {
        v - 1
    } else if v % 2 == 1 {
        v + 1
    } else {
        v
    }
}
