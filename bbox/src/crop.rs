use crate::{common::*, prelude::*, HW};

/// An integer pixel window `[l, r) × [t, b)` that lies inside an image.
///
/// The window is never empty: both sides are at least one pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CropWindow {
    t: u32,
    l: u32,
    b: u32,
    r: u32,
}

impl CropWindow {
    /// Pad the box by `pad_ratio` of its own extent on each side, then clamp
    /// it to the image.
    ///
    /// Padded edges are truncated toward zero. The top-left corner is clamped
    /// to the last pixel row and column so that a one-pixel window always fits.
    pub fn padded<R>(rect: &R, image_size: &HW<u32>, pad_ratio: f64) -> Result<Self>
    where
        R: Rect<Type = f64>,
    {
        ensure!(
            image_size.is_positive(),
            "image size must be positive, but get {:?}",
            image_size
        );
        ensure!(pad_ratio >= 0.0, "pad_ratio must be non-negative");

        let padded = rect.pad(pad_ratio);
        let img_h = image_size.h() as i64;
        let img_w = image_size.w() as i64;

        let l = (padded.l() as i64).clamp(0, img_w - 1);
        let t = (padded.t() as i64).clamp(0, img_h - 1);
        let r = cmp::min(img_w, padded.r() as i64);
        let b = cmp::min(img_h, padded.b() as i64);
        let r = if r <= l { l + 1 } else { r };
        let b = if b <= t { t + 1 } else { b };

        Ok(Self {
            t: t as u32,
            l: l as u32,
            b: b as u32,
            r: r as u32,
        })
    }

    pub fn t(&self) -> u32 {
        self.t
    }

    pub fn l(&self) -> u32 {
        self.l
    }

    pub fn b(&self) -> u32 {
        self.b
    }

    pub fn r(&self) -> u32 {
        self.r
    }

    pub fn h(&self) -> u32 {
        self.b - self.t
    }

    pub fn w(&self) -> u32 {
        self.r - self.l
    }

    /// The `[x, y, w, h]` tuple accepted by image cropping routines.
    pub fn xywh(&self) -> [u32; 4] {
        [self.l, self.t, self.w(), self.h()]
    }
}
