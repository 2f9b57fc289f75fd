//! Fit embedded images into the page content box.

/// Pixels per inch of the CSS reference pixel.
pub const PIXELS_PER_INCH: f32 = 96.0;

/// Usable area of a page, in inches.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContentBox {
    /// Maximum image width.
    pub max_width: f32,
    /// Maximum image height.
    pub max_height: f32,
    /// Images narrower than this are widened to it.
    pub min_width: f32,
}

impl Default for ContentBox {
    /// US Letter with half-inch margins.
    fn default() -> Self {
        Self {
            max_width: 7.5,
            max_height: 10.0,
            min_width: 1.0,
        }
    }
}

/// On-page size of an image, in inches.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderedImage {
    /// Final width.
    pub width: f32,
    /// Final height.
    pub height: f32,
}

/// Convert an intrinsic pixel size to inches.
pub fn pixels_to_inches(width_px: u32, height_px: u32) -> (f32, f32) {
    (
        width_px as f32 / PIXELS_PER_INCH,
        height_px as f32 / PIXELS_PER_INCH,
    )
}

/// Scale an image of intrinsic size `width` × `height` into `bounds`.
///
/// Steps, in order: shrink to the maximum width, then shrink to the
/// maximum height, then widen to the minimum width. The last step keeps the
/// source aspect ratio unless that would overflow the maximum height, in
/// which case the height is capped and the image is slightly distorted.
///
/// Both dimensions must be positive.
pub fn scale_image(width: f32, height: f32, bounds: &ContentBox) -> RenderedImage {
    let aspect = height / width;
    let (mut w, mut h) = (width, height);

    // Assign the bound directly so rounding never leaves us a hair over it
    if w > bounds.max_width {
        h *= bounds.max_width / w;
        w = bounds.max_width;
    }

    if h > bounds.max_height {
        w *= bounds.max_height / h;
        h = bounds.max_height;
    }

    if w < bounds.min_width {
        w = bounds.min_width;
        h = (w * aspect).min(bounds.max_height);
    }

    RenderedImage {
        width: w,
        height: h,
    }
}
