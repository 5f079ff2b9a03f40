//! Mouse movement and clicks on the desktop session via `xdotool`.

use super::rate_limit::{ActionLimits, LimitExceeded};
use crate::tools;
use mirror_core::messages::{MouseRequest, MouseResult};
use mirror_core::{MirrorError, MirrorResult};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Screen size assumed when `xdpyinfo` is unavailable.
pub const DEFAULT_BOUNDS: ScreenBounds = ScreenBounds {
    width: 1920,
    height: 1080,
};

const BOUNDS_TTL: Duration = Duration::from_secs(30);
const ACTION_TIMEOUT: Duration = Duration::from_secs(2);
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScreenBounds {
    pub width: u32,
    pub height: u32,
}

impl ScreenBounds {
    fn contains(&self, x: i64, y: i64) -> bool {
        x >= 0 && y >= 0 && x < i64::from(self.width) && y < i64::from(self.height)
    }
}

#[derive(Debug, Clone)]
pub struct MouseSettings {
    /// Program that performs the action (`xdotool`).
    pub tool: String,
    /// Program that reports the screen size (`xdpyinfo`).
    pub probe: String,
    pub display: String,
    pub max_per_second: u32,
    pub max_per_minute: u32,
}

impl Default for MouseSettings {
    fn default() -> Self {
        Self {
            tool: "xdotool".into(),
            probe: "xdpyinfo".into(),
            display: ":0".into(),
            max_per_second: 50,
            max_per_minute: 1000,
        }
    }
}

pub struct MouseDispatcher {
    settings: MouseSettings,
    limits: Mutex<ActionLimits>,
    bounds: tokio::sync::Mutex<Option<(ScreenBounds, Instant)>>,
}

impl MouseDispatcher {
    pub fn new(settings: MouseSettings) -> Self {
        let limits = ActionLimits::new(settings.max_per_second, settings.max_per_minute);
        Self {
            settings,
            limits: Mutex::new(limits),
            bounds: tokio::sync::Mutex::new(None),
        }
    }

    /// Validate and perform one mouse action on behalf of `source`.
    ///
    /// Movement happens only when both coordinates are given.
    pub async fn dispatch(&self, req: &MouseRequest, source: &str) -> MirrorResult<MouseResult> {
        self.admit(source)?;

        if !(1..=3).contains(&req.button) {
            warn!(button = req.button, "invalid mouse button");
            return Err(MirrorError::InvalidRequest(format!(
                "invalid mouse button {} (expected 1, 2 or 3)",
                req.button
            )));
        }

        let target = match (req.x, req.y) {
            (Some(x), Some(y)) => {
                let bounds = self.screen_bounds().await;
                if !bounds.contains(x, y) {
                    warn!(x, y, width = bounds.width, height = bounds.height, "coordinates out of bounds");
                    return Err(MirrorError::InvalidRequest(format!(
                        "coordinates ({x}, {y}) outside screen {}x{}",
                        bounds.width, bounds.height
                    )));
                }
                Some((x, y))
            }
            _ => None,
        };

        let display = tools::display_env(&self.settings.display);
        let env = [("DISPLAY", display.as_str())];

        if let Some((x, y)) = target {
            let (xs, ys) = (x.to_string(), y.to_string());
            tools::run(&self.settings.tool, &["mousemove", xs.as_str(), ys.as_str()], &env, ACTION_TIMEOUT).await?;
            debug!(x, y, "mouse moved");
        }
        if req.click {
            let button = req.button.to_string();
            tools::run(&self.settings.tool, &["click", button.as_str()], &env, ACTION_TIMEOUT).await?;
            info!(button = req.button, x = ?req.x, y = ?req.y, "mouse clicked");
        }

        Ok(MouseResult {
            status: "success".into(),
            moved: target.is_some(),
            clicked: req.click,
            x: target.map(|(x, _)| x),
            y: target.map(|(_, y)| y),
            button: req.click.then_some(req.button),
        })
    }

    fn admit(&self, source: &str) -> MirrorResult<()> {
        let now = Instant::now();
        let mut limits = self.limits.lock().unwrap_or_else(|p| p.into_inner());
        limits.gc(now);
        limits.admit(source, now).map_err(|exceeded| {
            warn!(source = %source, ?exceeded, "mouse rate limit exceeded");
            MirrorError::RateLimited(match exceeded {
                LimitExceeded::PerSecond(n) => format!("more than {n} mouse actions per second"),
                LimitExceeded::PerMinute(n) => format!("more than {n} mouse actions per minute"),
            })
        })
    }

    /// Current screen size, cached for 30 seconds.
    pub async fn screen_bounds(&self) -> ScreenBounds {
        let mut cache = self.bounds.lock().await;
        if let Some((bounds, at)) = *cache {
            if at.elapsed() < BOUNDS_TTL {
                return bounds;
            }
        }

        let display = tools::display_env(&self.settings.display);
        let bounds = match tools::run(&self.settings.probe, &[], &[("DISPLAY", display.as_str())], PROBE_TIMEOUT).await {
            Ok(out) => parse_dimensions(&String::from_utf8_lossy(&out.stdout)).unwrap_or_else(|| {
                warn!("could not parse screen dimensions, using default");
                DEFAULT_BOUNDS
            }),
            Err(e) => {
                warn!(error = %e, "screen size probe failed, using default");
                DEFAULT_BOUNDS
            }
        };
        debug!(width = bounds.width, height = bounds.height, "screen bounds");
        *cache = Some((bounds, Instant::now()));
        bounds
    }
}

/// Parse the `dimensions:` line of `xdpyinfo` output, e.g.
/// `  dimensions:    1920x1080 pixels (508x285 millimeters)`.
pub fn parse_dimensions(output: &str) -> Option<ScreenBounds> {
    let line = output.lines().find(|l| l.trim_start().starts_with("dimensions:"))?;
    let dims = line.split_whitespace().nth(1)?;
    let (w, h) = dims.split_once('x')?;
    Some(ScreenBounds {
        width: w.parse().ok()?,
        height: h.parse().ok()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dispatcher(max_per_second: u32) -> MouseDispatcher {
        MouseDispatcher::new(MouseSettings {
            tool: "true".into(),
            probe: "/nonexistent/xdpyinfo".into(),
            max_per_second,
            ..MouseSettings::default()
        })
    }

    fn req(x: Option<i64>, y: Option<i64>, click: bool, button: u8) -> MouseRequest {
        MouseRequest { x, y, click, button }
    }

    #[test]
    fn parses_xdpyinfo() {
        let out = "screen #0:\n  dimensions:    2560x1440 pixels (677x381 millimeters)\n  resolution:    96x96 dots per inch\n";
        assert_eq!(
            parse_dimensions(out),
            Some(ScreenBounds {
                width: 2560,
                height: 1440
            })
        );
        assert_eq!(parse_dimensions("no screens here"), None);
        assert_eq!(parse_dimensions("  dimensions:  axb pixels"), None);
    }

    #[tokio::test]
    async fn falls_back_to_default_bounds() {
        assert_eq!(dispatcher(50).screen_bounds().await, DEFAULT_BOUNDS);
    }

    #[tokio::test]
    async fn move_and_click() {
        let d = dispatcher(50);
        let result = d.dispatch(&req(Some(10), Some(20), true, 3), "phone").await.unwrap();
        assert_eq!(result.status, "success");
        assert!(result.moved && result.clicked);
        assert_eq!((result.x, result.y, result.button), (Some(10), Some(20), Some(3)));
    }

    #[tokio::test]
    async fn click_without_coordinates() {
        let d = dispatcher(50);
        let result = d.dispatch(&req(Some(10), None, true, 1), "phone").await.unwrap();
        assert!(!result.moved);
        assert!(result.clicked);
        assert_eq!(result.x, None);
    }

    #[tokio::test]
    async fn rejects_bad_button() {
        let err = dispatcher(50).dispatch(&req(None, None, true, 4), "phone").await.unwrap_err();
        assert!(matches!(err, MirrorError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn rejects_out_of_bounds() {
        let d = dispatcher(50);
        for (x, y) in [(-1, 5), (5, -1), (1920, 0), (0, 1080)] {
            let err = d.dispatch(&req(Some(x), Some(y), false, 1), "phone").await.unwrap_err();
            assert!(matches!(err, MirrorError::InvalidRequest(_)), "({x}, {y})");
        }
        assert!(d.dispatch(&req(Some(1919), Some(1079), false, 1), "phone").await.is_ok());
    }

    #[tokio::test]
    async fn rate_limited() {
        let d = dispatcher(2);
        d.dispatch(&req(None, None, false, 1), "phone").await.unwrap();
        d.dispatch(&req(None, None, false, 1), "phone").await.unwrap();
        let err = d.dispatch(&req(None, None, false, 1), "phone").await.unwrap_err();
        assert!(matches!(err, MirrorError::RateLimited(_)));
        // Other clients have their own window.
        assert!(d.dispatch(&req(None, None, false, 1), "laptop").await.is_ok());
    }

    #[tokio::test]
    async fn tool_failure_is_reported() {
        let d = MouseDispatcher::new(MouseSettings {
            tool: "false".into(),
            probe: "/nonexistent/xdpyinfo".into(),
            ..MouseSettings::default()
        });
        let err = d.dispatch(&req(Some(1), Some(1), false, 1), "phone").await.unwrap_err();
        assert!(matches!(err, MirrorError::Tool(_)));
    }
}
