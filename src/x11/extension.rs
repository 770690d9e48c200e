use super::{MissingExtensionError, NotSupportedError, X11Error};

use x11rb::connection::Connection;
use x11rb::protocol::xproto::ConnectionExt as _;

/// The extension macro.
///
/// This macro generates a struct which checks for the presence of some X11
/// extensions and stores the version supplied by the X server.
///
/// The version policy matches what the presentation protocol needs: the
/// major version must be exactly the one this library was written against
/// (a major bump may change request semantics), the minor version must be
/// at least the stated minimum, and a higher version is requested so newer
/// optional requests (e.g. the syncobj ones) become available when the
/// server has them.
macro_rules! extensions {
    (
        $(
            $extension:ident { // Extension name for path lookup
                $extension_fn:ident, // Function used to look up the version of the extension
                exact_major: $major:expr,
                minimum_minor: $min_minor:expr,
                request: ($req_major:expr, $req_minor:expr),
            },
        )*
    ) => {
        #[derive(Debug, Copy, Clone)]
        pub struct Extensions {
            $(
                #[doc = concat!(" The version of the `", stringify!($extension), "` extension.")]
                pub $extension: (u32, u32),
            )*
        }

        impl Extensions {
            pub fn check_extensions<C: Connection>(connection: &C, logger: &slog::Logger) -> Result<Extensions, X11Error> {
                $(
                    let $extension = {
                        use x11rb::protocol::$extension::{ConnectionExt as _, X11_EXTENSION_NAME};

                        if connection.extension_information(X11_EXTENSION_NAME)?.is_some() {
                            let version = connection.$extension_fn($req_major, $req_minor)?.reply()?;

                            if version.major_version == $major && version.minor_version >= $min_minor {
                                slog::info!(
                                    logger,
                                    "Loaded extension {} version {}.{}",
                                    X11_EXTENSION_NAME,
                                    version.major_version,
                                    version.minor_version,
                                );

                                (version.major_version, version.minor_version)
                            } else {
                                slog::error!(
                                    logger,
                                    "{} extension version is incompatible (have {}.{}, need {}.{})",
                                    X11_EXTENSION_NAME,
                                    version.major_version,
                                    version.minor_version,
                                    $major,
                                    $min_minor,
                                );

                                return Err(MissingExtensionError::WrongVersion {
                                    name: X11_EXTENSION_NAME,
                                    required_major: $major,
                                    required_minor: $min_minor,
                                    available_major: version.major_version,
                                    available_minor: version.minor_version,
                                }.into());
                            }
                        } else {
                            slog::error!(logger, "{} extension not found", X11_EXTENSION_NAME);

                            return Err(MissingExtensionError::NotFound {
                                name: X11_EXTENSION_NAME,
                                major: $major,
                                minor: $min_minor,
                            }
                            .into());
                        }
                    };
                )*

                Ok(Extensions {
                    $(
                        $extension,
                    )*
                })
            }
        }
    };
}

extensions! {
    dri3 {
        dri3_query_version,
        exact_major: 1,
        minimum_minor: 2,
        request: (1, 4),
    },

    present {
        present_query_version,
        exact_major: 1,
        minimum_minor: 2,
        request: (1, 4),
    },
}

impl Extensions {
    /// DRI3 and Present both grew timeline-syncobj support in their 1.4
    /// revisions; explicit sync needs both.
    pub fn supports_syncobj_requests(&self) -> bool {
        self.dri3.1 >= 4 && self.present.1 >= 4
    }
}

/// Environment variable overriding the NV-GLX gate below.
pub(super) const FORCE_ENABLE_ENV: &str = "__NV_FORCE_ENABLE_X11_EGL_PLATFORM";

/// Checks whether the server runs a native NVIDIA GLX stack.
///
/// If NV-GLX is present we are talking to a regular X server with the
/// NVIDIA driver, and the driver's own (non-DRI3) X11 path must stay in
/// charge. The check can be overridden with
/// `__NV_FORCE_ENABLE_X11_EGL_PLATFORM=1` for testing against such servers.
pub(super) fn reject_native_nvidia_server<C: Connection>(connection: &C) -> Result<(), X11Error> {
    if let Ok(force) = std::env::var(FORCE_ENABLE_ENV) {
        if force.trim().parse::<i32>().unwrap_or(0) != 0 {
            return Ok(());
        }
    }

    let reply = connection.query_extension(b"NV-GLX")?.reply()?;
    if reply.present {
        return Err(NotSupportedError::NativeNvidiaServer.into());
    }

    Ok(())
}
