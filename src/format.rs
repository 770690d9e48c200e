//! Format info tables for DRM formats.
//!
//! The X11 parts of this crate need to reason about pixel formats in two
//! ways that [`drm_fourcc`] alone does not cover: matching a fourcc code
//! against the RGB masks of a TrueColor visual, and validating the
//! depth/bpp that the server reports for a pixmap. This module provides a
//! small static table with exactly that information.
//!
//! ```
//! # use drm_fourcc::DrmFourcc;
//! # use egl_x11_bridge::format::info;
//! let fmt = info(DrmFourcc::Xrgb8888).unwrap();
//! assert_eq!(fmt.bpp, 32);
//! assert_eq!(fmt.depth, 24);
//! assert_eq!(fmt.red_mask, 0x00ff0000);
//! ```

use drm_fourcc::DrmFourcc;

/// Static pixel layout description for one fourcc code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatInfo {
    /// The fourcc code this entry describes.
    pub fourcc: DrmFourcc,
    /// Bits per pixel, including padding.
    pub bpp: u8,
    /// Significant bits per pixel (the X11 depth for this format).
    pub depth: u8,
    /// Bit mask of the red channel.
    pub red_mask: u32,
    /// Bit mask of the green channel.
    pub green_mask: u32,
    /// Bit mask of the blue channel.
    pub blue_mask: u32,
    /// Bit mask of the alpha channel, zero for opaque formats.
    pub alpha_mask: u32,
}

macro_rules! format_table {
    (
        $($fourcc: ident {
            bpp: $bpp: expr,
            depth: $depth: expr,
            red: $red: expr,
            green: $green: expr,
            blue: $blue: expr,
            alpha: $alpha: expr $(,)?
        }),* $(,)?
    ) => {
        static FORMATS: &[FormatInfo] = &[
            $(
                FormatInfo {
                    fourcc: DrmFourcc::$fourcc,
                    bpp: $bpp,
                    depth: $depth,
                    red_mask: $red,
                    green_mask: $green,
                    blue_mask: $blue,
                    alpha_mask: $alpha,
                },
            )*
        ];
    };
}

format_table! {
    Argb8888 {
        bpp: 32,
        depth: 32,
        red: 0x00ff0000,
        green: 0x0000ff00,
        blue: 0x000000ff,
        alpha: 0xff000000,
    },
    Xrgb8888 {
        bpp: 32,
        depth: 24,
        red: 0x00ff0000,
        green: 0x0000ff00,
        blue: 0x000000ff,
        alpha: 0,
    },
    Abgr8888 {
        bpp: 32,
        depth: 32,
        red: 0x000000ff,
        green: 0x0000ff00,
        blue: 0x00ff0000,
        alpha: 0xff000000,
    },
    Xbgr8888 {
        bpp: 32,
        depth: 24,
        red: 0x000000ff,
        green: 0x0000ff00,
        blue: 0x00ff0000,
        alpha: 0,
    },
    Argb2101010 {
        bpp: 32,
        depth: 32,
        red: 0x3ff00000,
        green: 0x000ffc00,
        blue: 0x000003ff,
        alpha: 0xc0000000,
    },
    Xrgb2101010 {
        bpp: 32,
        depth: 30,
        red: 0x3ff00000,
        green: 0x000ffc00,
        blue: 0x000003ff,
        alpha: 0,
    },
    Abgr2101010 {
        bpp: 32,
        depth: 32,
        red: 0x000003ff,
        green: 0x000ffc00,
        blue: 0x3ff00000,
        alpha: 0xc0000000,
    },
    Xbgr2101010 {
        bpp: 32,
        depth: 30,
        red: 0x000003ff,
        green: 0x000ffc00,
        blue: 0x3ff00000,
        alpha: 0,
    },
    Rgb565 {
        bpp: 16,
        depth: 16,
        red: 0xf800,
        green: 0x07e0,
        blue: 0x001f,
        alpha: 0,
    },
    Argb1555 {
        bpp: 16,
        depth: 16,
        red: 0x7c00,
        green: 0x03e0,
        blue: 0x001f,
        alpha: 0x8000,
    },
    Xrgb1555 {
        bpp: 16,
        depth: 15,
        red: 0x7c00,
        green: 0x03e0,
        blue: 0x001f,
        alpha: 0,
    },
}

/// Looks up the [`FormatInfo`] for a fourcc code.
///
/// Unknown formats return [`None`].
pub fn info(fourcc: DrmFourcc) -> Option<&'static FormatInfo> {
    FORMATS.iter().find(|fmt| fmt.fourcc == fourcc)
}

/// Returns every format this crate knows how to describe.
pub fn known_formats() -> &'static [FormatInfo] {
    FORMATS
}

impl FormatInfo {
    /// Checks whether a TrueColor visual with the given masks displays this
    /// format correctly.
    ///
    /// The match must be exact; a visual with narrower or shuffled channels
    /// would silently display wrong colors.
    pub fn matches_visual_masks(&self, depth: u8, red: u32, green: u32, blue: u32) -> bool {
        self.depth == depth && self.red_mask == red && self.green_mask == green && self.blue_mask == blue
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Tests that no channel masks within a format overlap.
    #[test]
    fn masks_disjoint() {
        for fmt in known_formats() {
            let mut seen = 0u32;
            for mask in [fmt.red_mask, fmt.green_mask, fmt.blue_mask, fmt.alpha_mask] {
                assert_eq!(seen & mask, 0, "{:?} has overlapping channel masks", fmt.fourcc);
                seen |= mask;
            }
        }
    }

    /// Tests that the depth is the popcount of all channel masks combined.
    #[test]
    fn depth_matches_masks() {
        for fmt in known_formats() {
            let bits = (fmt.red_mask | fmt.green_mask | fmt.blue_mask | fmt.alpha_mask).count_ones();
            assert_eq!(
                bits, fmt.depth as u32,
                "{:?} depth disagrees with channel masks",
                fmt.fourcc
            );
        }
    }

    /// Tests that depth never exceeds bpp and masks fit inside bpp bits.
    #[test]
    fn masks_fit_bpp() {
        for fmt in known_formats() {
            assert!(fmt.depth <= fmt.bpp);
            let all = fmt.red_mask | fmt.green_mask | fmt.blue_mask | fmt.alpha_mask;
            if fmt.bpp < 32 {
                assert_eq!(all >> fmt.bpp, 0, "{:?} masks exceed bpp", fmt.fourcc);
            }
        }
    }

    #[test]
    fn visual_match_is_exact() {
        let fmt = info(DrmFourcc::Xrgb8888).unwrap();
        assert!(fmt.matches_visual_masks(24, 0x00ff0000, 0x0000ff00, 0x000000ff));
        // A BGR visual with the same depth must not match.
        assert!(!fmt.matches_visual_masks(24, 0x000000ff, 0x0000ff00, 0x00ff0000));
        // Same masks at a different depth must not match either.
        assert!(!fmt.matches_visual_masks(32, 0x00ff0000, 0x0000ff00, 0x000000ff));
    }

    #[test]
    fn lookup_unknown_is_none() {
        assert!(info(DrmFourcc::Yuyv).is_none());
    }
}
