//! QR codes for the connection URL, rendered by `qrencode` when it is
//! installed and by the `qrcode` crate otherwise.

use crate::tools;
use axum::http::Uri;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use image::{DynamicImage, ImageFormat, Luma};
use mirror_core::messages::{ConnectionMetadata, QrResponse, QrSize};
use mirror_core::{MirrorError, MirrorResult};
use qrcode::QrCode;
use std::io::Cursor;
use std::time::Duration;
use tracing::{info, warn};

pub const MAX_URL_LENGTH: usize = 2048;

const ENCODE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct QrEncoder {
    program: String,
}

impl Default for QrEncoder {
    fn default() -> Self {
        Self::new("qrencode")
    }
}

impl QrEncoder {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Render `url` as a PNG and describe the connection it points at.
    pub async fn generate(&self, url: &str, size: QrSize) -> MirrorResult<QrResponse> {
        let metadata = validate_url(url)?;
        let png = match self.encode_with_tool(url, size).await {
            Ok(png) => png,
            Err(e) => {
                warn!(program = %self.program, error = %e, "QR tool unavailable, rendering in process");
                render_png(url, size)?
            }
        };

        info!(url = %url, size = ?size, bytes = png.len(), "generated QR code");
        Ok(QrResponse {
            url: url.to_string(),
            size,
            qr_base64: format!("data:image/png;base64,{}", STANDARD.encode(&png)),
            qr_size_bytes: png.len(),
            metadata,
        })
    }

    async fn encode_with_tool(&self, url: &str, size: QrSize) -> MirrorResult<Vec<u8>> {
        let scale = module_size(size).to_string();
        let out = tools::run(
            &self.program,
            &["-t", "PNG", "-o", "-", "-s", scale.as_str(), url],
            &[],
            ENCODE_TIMEOUT,
        )
        .await?;
        if out.stdout.is_empty() {
            return Err(MirrorError::Tool(format!("{} produced no image", self.program)));
        }
        Ok(out.stdout)
    }
}

/// Encode `url` as a PNG without external tools, with the same module size
/// and quiet zone `qrencode` uses.
pub fn render_png(url: &str, size: QrSize) -> MirrorResult<Vec<u8>> {
    let code = QrCode::new(url.as_bytes())
        .map_err(|e| MirrorError::InvalidRequest(format!("url cannot be encoded as a QR code: {e}")))?;
    let scale = u32::from(module_size(size));
    let image = code
        .render::<Luma<u8>>()
        .module_dimensions(scale, scale)
        .quiet_zone(true)
        .build();

    let mut png = Vec::new();
    DynamicImage::ImageLuma8(image)
        .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
        .map_err(|e| MirrorError::Other(format!("PNG encoding failed: {e}")))?;
    Ok(png)
}

/// Pixels per QR module for each size.
pub fn module_size(size: QrSize) -> u8 {
    match size {
        QrSize::Small => 3,
        QrSize::Medium => 6,
        QrSize::Large => 10,
    }
}

/// Accept only `http(s)://` URLs up to [`MAX_URL_LENGTH`] characters and
/// return what the client needs to know about them.
pub fn validate_url(url: &str) -> MirrorResult<ConnectionMetadata> {
    if url.is_empty() || url.len() > MAX_URL_LENGTH {
        warn!(length = url.len(), "rejected QR url length");
        return Err(MirrorError::InvalidRequest(format!(
            "url must be 1..={MAX_URL_LENGTH} characters"
        )));
    }
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        warn!(url = %url, "rejected QR url scheme");
        return Err(MirrorError::InvalidRequest("url must start with http:// or https://".into()));
    }
    let uri: Uri = url
        .parse()
        .map_err(|e| MirrorError::InvalidRequest(format!("invalid url: {e}")))?;
    let host = uri
        .host()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| MirrorError::InvalidRequest("url has no host".into()))?;

    Ok(ConnectionMetadata {
        connection_type: "mobile_mirror".into(),
        protocol: uri.scheme_str().unwrap_or("https").to_string(),
        host: host.to_string(),
        port: uri.port_u16(),
        path: uri.path().to_string(),
    })
}
