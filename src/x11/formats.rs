//! Driver format registry and config records.
//!
//! At display initialization the driver is asked which fourcc formats it
//! can import as dma-bufs and which modifiers each format supports. The
//! modifier lists are split into renderable and external-only halves;
//! only renderable modifiers may back a window or pixmap surface, the
//! external-only ones merely exist so the negotiation code can recognize
//! them in server responses.
//!
//! Config records pair the driver's EGL configs with a fourcc and, when a
//! matching TrueColor visual exists on the screen, a native visual id.

use drm_fourcc::{DrmFourcc, DrmModifier};
use x11rb::connection::Connection;
use x11rb::protocol::dri3::ConnectionExt as _;
use x11rb::protocol::xproto::{Depth, VisualClass, Visualid};

use crate::driver::{DriverConfig, DriverDisplay, PlatformDriver};
use crate::format::{self, FormatInfo};

use super::error::X11Error;

/// One driver-supported format with its modifier lists.
#[derive(Debug)]
pub struct DriverFormat {
    /// Static layout description of the format.
    pub info: &'static FormatInfo,
    /// Modifiers the driver can render to.
    pub renderable: Vec<DrmModifier>,
    /// Modifiers the driver can only sample from.
    pub external_only: Vec<DrmModifier>,
}

impl DriverFormat {
    /// Whether the driver can render this format with `modifier`.
    pub fn is_renderable(&self, modifier: DrmModifier) -> bool {
        self.renderable.contains(&modifier)
    }
}

/// All formats the driver supports, sorted by fourcc for lookup.
#[derive(Debug, Default)]
pub struct FormatTable {
    formats: Vec<DriverFormat>,
}

impl FormatTable {
    /// Queries the driver for its dma-buf formats and modifiers.
    ///
    /// Formats this crate has no layout information for, and formats
    /// without a single renderable modifier, are skipped.
    pub fn query(driver: &dyn PlatformDriver, display: DriverDisplay) -> Result<FormatTable, X11Error> {
        let mut formats = Vec::new();

        for fourcc in driver.query_dmabuf_formats(display)? {
            let info = match format::info(fourcc) {
                Some(info) => info,
                None => continue,
            };

            let mut renderable = Vec::new();
            let mut external_only = Vec::new();
            for (modifier, external) in driver.query_dmabuf_modifiers(display, fourcc)? {
                if external {
                    external_only.push(modifier);
                } else {
                    renderable.push(modifier);
                }
            }

            if renderable.is_empty() {
                continue;
            }

            formats.push(DriverFormat {
                info,
                renderable,
                external_only,
            });
        }

        formats.sort_by_key(|fmt| fmt.info.fourcc as u32);
        Ok(FormatTable { formats })
    }

    /// Looks up a format by fourcc.
    pub fn find(&self, fourcc: DrmFourcc) -> Option<&DriverFormat> {
        self.formats
            .binary_search_by_key(&(fourcc as u32), |fmt| fmt.info.fourcc as u32)
            .ok()
            .map(|idx| &self.formats[idx])
    }

    /// True if no formats are usable at all.
    pub fn is_empty(&self) -> bool {
        self.formats.is_empty()
    }
}

bitflags::bitflags! {
    /// Surface types a config supports, mirroring the EGL surface-type bits
    /// this library is responsible for.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SurfaceTypes: u32 {
        /// The config can back a window surface.
        const WINDOW = 1 << 0;
        /// The config can back a pixmap surface.
        const PIXMAP = 1 << 1;
    }
}

/// One of the driver's EGL configs, annotated for X11 use.
#[derive(Debug, Clone, Copy)]
pub struct ConfigRecord {
    /// The driver's config handle.
    pub driver_config: DriverConfig,
    /// The fourcc format of the config, if it has a dma-buf representation
    /// the driver format table knows.
    pub fourcc: Option<DrmFourcc>,
    /// Surface types this config supports on this display.
    pub surface_types: SurfaceTypes,
    /// The TrueColor visual displaying this config faithfully, if any.
    pub native_visual: Option<Visualid>,
}

impl ConfigRecord {
    /// Checks the depth/bpp the server reports for a native pixmap against
    /// this config's format.
    pub fn matches_native_pixmap(&self, depth: u8, bpp: u8) -> bool {
        self.fourcc
            .and_then(format::info)
            .map(|info| info.depth == depth && info.bpp == bpp)
            .unwrap_or(false)
    }
}

/// Finds a TrueColor visual whose masks display `fmt` exactly.
pub(super) fn find_visual(depths: &[Depth], fmt: &FormatInfo) -> Option<Visualid> {
    depths
        .iter()
        .filter(|depth| depth.depth == fmt.depth)
        .flat_map(|depth| depth.visuals.iter().map(move |visual| (depth.depth, visual)))
        .find(|(depth, visual)| {
            visual.class == VisualClass::TRUE_COLOR
                && fmt.matches_visual_masks(*depth, visual.red_mask, visual.green_mask, visual.blue_mask)
        })
        .map(|(_, visual)| visual.visual_id)
}

/// Builds the config list for a display.
///
/// Configs whose format is unknown to the driver lose both surface bits.
/// Known formats always get the pixmap bit (PRIME can synthesize a linear
/// intermediate for any of them); the window bit additionally requires a
/// matching visual on the screen.
pub(super) fn build_config_list(
    driver: &dyn PlatformDriver,
    display: DriverDisplay,
    table: &FormatTable,
    depths: &[Depth],
) -> Vec<ConfigRecord> {
    driver
        .configs(display)
        .into_iter()
        .map(|config| {
            let fourcc = driver
                .config_fourcc(display, config)
                .filter(|fourcc| table.find(*fourcc).is_some());

            let mut surface_types = SurfaceTypes::empty();
            let mut native_visual = None;
            if let Some(info) = fourcc.and_then(format::info) {
                surface_types |= SurfaceTypes::PIXMAP;
                if let Some(visual) = find_visual(depths, info) {
                    native_visual = Some(visual);
                    surface_types |= SurfaceTypes::WINDOW;
                }
            }

            ConfigRecord {
                driver_config: config,
                fourcc,
                surface_types,
                native_visual,
            }
        })
        .collect()
}

/// Asks the server which modifiers it supports for a drawable.
///
/// Returns the per-window and per-screen lists from
/// `DRI3GetSupportedModifiers`.
pub(super) fn server_supported_modifiers<C: Connection>(
    connection: &C,
    drawable: u32,
    info: &FormatInfo,
) -> Result<(Vec<DrmModifier>, Vec<DrmModifier>), X11Error> {
    let reply = connection
        .dri3_get_supported_modifiers(drawable, info.depth, info.bpp)?
        .reply()?;

    Ok((
        reply.window_modifiers.iter().map(|&m| DrmModifier::from(m)).collect(),
        reply.screen_modifiers.iter().map(|&m| DrmModifier::from(m)).collect(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::testing::FakeDriver;
    use x11rb::protocol::xproto::Visualtype;

    fn visual(id: Visualid, class: VisualClass, red: u32, green: u32, blue: u32) -> Visualtype {
        Visualtype {
            visual_id: id,
            class,
            bits_per_rgb_value: 8,
            colormap_entries: 256,
            red_mask: red,
            green_mask: green,
            blue_mask: blue,
        }
    }

    fn x11_depths() -> Vec<Depth> {
        vec![
            Depth {
                depth: 24,
                visuals: vec![
                    // DirectColor with the right masks must be skipped.
                    visual(0x20, VisualClass::DIRECT_COLOR, 0x00ff0000, 0x0000ff00, 0x000000ff),
                    visual(0x21, VisualClass::TRUE_COLOR, 0x00ff0000, 0x0000ff00, 0x000000ff),
                ],
            },
            Depth {
                depth: 32,
                visuals: vec![visual(0x22, VisualClass::TRUE_COLOR, 0x00ff0000, 0x0000ff00, 0x000000ff)],
            },
        ]
    }

    #[test]
    fn visual_lookup_requires_truecolor_and_depth() {
        let depths = x11_depths();

        let xrgb = format::info(DrmFourcc::Xrgb8888).unwrap();
        assert_eq!(find_visual(&depths, xrgb), Some(0x21));

        let argb = format::info(DrmFourcc::Argb8888).unwrap();
        assert_eq!(find_visual(&depths, argb), Some(0x22));

        // BGR layout exists at no depth with matching masks.
        let xbgr = format::info(DrmFourcc::Xbgr8888).unwrap();
        assert_eq!(find_visual(&depths, xbgr), None);
    }

    #[test]
    fn format_table_splits_and_skips() {
        let driver = FakeDriver {
            formats: vec![
                (
                    DrmFourcc::Xrgb8888,
                    vec![
                        (DrmModifier::Linear, false),
                        (DrmModifier::Unrecognized(0x0300000000fe0001), true),
                    ],
                ),
                // External-only everywhere: not usable for rendering.
                (DrmFourcc::Argb8888, vec![(DrmModifier::Linear, true)]),
                // No layout info for YUV formats in this crate.
                (DrmFourcc::Yuyv, vec![(DrmModifier::Linear, false)]),
            ],
            ..Default::default()
        };

        let table = FormatTable::query(&driver, DriverDisplay(1)).unwrap();
        let xrgb = table.find(DrmFourcc::Xrgb8888).unwrap();
        assert_eq!(xrgb.renderable, vec![DrmModifier::Linear]);
        assert_eq!(xrgb.external_only.len(), 1);
        assert!(!xrgb.is_renderable(DrmModifier::Unrecognized(0x0300000000fe0001)));

        assert!(table.find(DrmFourcc::Argb8888).is_none());
        assert!(table.find(DrmFourcc::Yuyv).is_none());
    }

    #[test]
    fn config_list_bits() {
        let driver = FakeDriver {
            formats: vec![
                (DrmFourcc::Xrgb8888, vec![(DrmModifier::Linear, false)]),
                (DrmFourcc::Xbgr8888, vec![(DrmModifier::Linear, false)]),
            ],
            ..Default::default()
        };
        let display = DriverDisplay(1);
        let table = FormatTable::query(&driver, display).unwrap();
        let configs = build_config_list(&driver, display, &table, &x11_depths());
        assert_eq!(configs.len(), 2);

        // Xrgb8888 has a visual: window + pixmap.
        assert_eq!(configs[0].surface_types, SurfaceTypes::WINDOW | SurfaceTypes::PIXMAP);
        assert_eq!(configs[0].native_visual, Some(0x21));
        assert!(configs[0].matches_native_pixmap(24, 32));
        assert!(!configs[0].matches_native_pixmap(32, 32));

        // Xbgr8888 has no visual: pixmap only.
        assert_eq!(configs[1].surface_types, SurfaceTypes::PIXMAP);
        assert_eq!(configs[1].native_visual, None);
    }
}
