//! Modifier negotiation between the driver and the server.
//!
//! The goal is to find a set of modifiers the driver can render and the
//! server can scan out or composite without an extra copy. When no such
//! set exists the window falls back to PRIME: rendering happens with
//! whatever modifier the driver prefers, and each frame is blitted into a
//! pitch-linear intermediate that any device can read.

use drm_fourcc::DrmModifier;

/// Result of a successful negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    /// Whether frames must go through a linear PRIME intermediate.
    pub prime: bool,
    /// Modifiers for the render pool. Without PRIME these are also what
    /// the server sees; with PRIME the server only ever sees
    /// [`DrmModifier::Linear`] intermediates and this list is free to use
    /// the driver's preference.
    pub render_modifiers: Vec<DrmModifier>,
}

/// Picks the modifiers for a window.
///
/// `window_modifiers` is `None` when the server was not asked (forced
/// PRIME); otherwise it holds the per-window list from
/// `DRI3GetSupportedModifiers`, with `screen_modifiers` as the screen-wide
/// fallback. Returns `None` when the window cannot be presented at all.
///
/// A subtlety worth spelling out: a *non-empty* per-window list that does
/// not intersect the driver's means the server is telling us that nothing
/// outside that list avoids a server-side copy. Falling back to the screen
/// list would merely trade a client-side blit for a server-side one, so in
/// that case we go straight to PRIME. The screen list is only consulted
/// when the server had no per-window preference at all.
pub fn negotiate(
    driver_modifiers: &[DrmModifier],
    window_modifiers: Option<&[DrmModifier]>,
    screen_modifiers: &[DrmModifier],
    supports_prime: bool,
    force_prime: bool,
) -> Option<Negotiated> {
    if force_prime {
        return Some(Negotiated {
            prime: true,
            render_modifiers: driver_modifiers.to_vec(),
        });
    }

    let window_modifiers = window_modifiers.unwrap_or(&[]);
    let direct = intersect(driver_modifiers, window_modifiers);
    if !direct.is_empty() {
        return Some(Negotiated {
            prime: false,
            render_modifiers: direct,
        });
    }

    if window_modifiers.is_empty() {
        let screen = intersect(driver_modifiers, screen_modifiers);
        if !screen.is_empty() {
            return Some(Negotiated {
                prime: false,
                render_modifiers: screen,
            });
        }
    }

    if supports_prime {
        Some(Negotiated {
            prime: true,
            render_modifiers: driver_modifiers.to_vec(),
        })
    } else {
        None
    }
}

fn intersect(driver: &[DrmModifier], server: &[DrmModifier]) -> Vec<DrmModifier> {
    driver
        .iter()
        .copied()
        .filter(|modifier| server.contains(modifier))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MOD_A: DrmModifier = DrmModifier::Unrecognized(0x0300000000000001);
    const MOD_B: DrmModifier = DrmModifier::Unrecognized(0x0300000000000002);

    fn assert_subset(sub: &[DrmModifier], of: &[DrmModifier]) {
        for modifier in sub {
            assert!(of.contains(modifier), "{:?} not in {:?}", modifier, of);
        }
    }

    #[test]
    fn window_intersection_wins() {
        let driver = [DrmModifier::Linear, MOD_A];
        let chosen = negotiate(&driver, Some(&[MOD_A]), &[DrmModifier::Linear], true, false).unwrap();
        assert!(!chosen.prime);
        assert_eq!(chosen.render_modifiers, vec![MOD_A]);
        assert_subset(&chosen.render_modifiers, &driver);
    }

    /// A non-empty window list that misses the driver set means PRIME,
    /// even when the screen list would intersect.
    #[test]
    fn nonempty_window_list_blocks_screen_fallback() {
        let driver = [DrmModifier::Linear, MOD_A];
        let chosen = negotiate(&driver, Some(&[MOD_B]), &[DrmModifier::Linear], true, false).unwrap();
        assert!(chosen.prime);
        assert_eq!(chosen.render_modifiers, driver.to_vec());
    }

    #[test]
    fn empty_window_list_falls_back_to_screen() {
        let driver = [DrmModifier::Linear, MOD_A];
        let chosen = negotiate(&driver, Some(&[]), &[DrmModifier::Linear], true, false).unwrap();
        assert!(!chosen.prime);
        assert_eq!(chosen.render_modifiers, vec![DrmModifier::Linear]);
    }

    #[test]
    fn unusable_without_prime() {
        let driver = [MOD_A];
        assert_eq!(negotiate(&driver, Some(&[MOD_B]), &[], false, false), None);
        // The same situation with PRIME available is fine.
        assert!(negotiate(&driver, Some(&[MOD_B]), &[], true, false).unwrap().prime);
    }

    #[test]
    fn force_prime_skips_the_server() {
        let driver = [MOD_A, MOD_B];
        let chosen = negotiate(&driver, None, &[], false, true).unwrap();
        assert!(chosen.prime);
        assert_eq!(chosen.render_modifiers, driver.to_vec());
    }

    /// The property from the test plan: the chosen list is a subset of
    /// driver ∩ window, or of driver ∩ screen when the window list was
    /// empty, or PRIME is enabled and the render list is the driver's.
    #[test]
    fn negotiation_property() {
        let pools: &[&[DrmModifier]] = &[
            &[],
            &[DrmModifier::Linear],
            &[MOD_A],
            &[MOD_A, MOD_B],
            &[DrmModifier::Linear, MOD_A],
            &[DrmModifier::Linear, MOD_A, MOD_B],
        ];

        for driver in pools {
            for window in pools {
                for screen in pools {
                    for prime_ok in [false, true] {
                        let result = negotiate(driver, Some(window), screen, prime_ok, false);
                        match result {
                            Some(Negotiated { prime: false, render_modifiers }) => {
                                assert!(!render_modifiers.is_empty());
                                if window.is_empty() {
                                    assert_subset(&render_modifiers, driver);
                                    assert_subset(&render_modifiers, screen);
                                } else {
                                    assert_subset(&render_modifiers, driver);
                                    assert_subset(&render_modifiers, window);
                                }
                            }
                            Some(Negotiated { prime: true, render_modifiers }) => {
                                assert!(prime_ok);
                                assert_eq!(&render_modifiers, driver);
                            }
                            None => {
                                assert!(!prime_ok);
                                assert!(intersect(driver, window).is_empty());
                            }
                        }
                    }
                }
            }
        }
    }
}
