//! XMLTV fetcher for downloading and decompressing EPG data.

use flate2::read::GzDecoder;
use std::io::Read;
use std::time::Duration;

use super::types::XmltvError;

/// Maximum download timeout.
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);

/// Maximum redirects followed during a fetch.
const MAX_REDIRECTS: usize = 5;

/// Fetch XMLTV data from a URL.
///
/// Sends `Accept-Encoding: gzip` and handles both plain XML and gzipped
/// payloads, auto-detected from magic bytes or the content-type header.
/// Returns the decompressed XMLTV data as bytes.
pub async fn fetch_xmltv(url: &str) -> Result<Vec<u8>, XmltvError> {
    let client = reqwest::Client::builder()
        .timeout(DOWNLOAD_TIMEOUT)
        .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
        .build()
        .map_err(|e| XmltvError::DownloadError(format!("Failed to create HTTP client: {}", e)))?;

    let response = client
        .get(url)
        .header("Accept-Encoding", "gzip")
        .send()
        .await
        .map_err(|e| XmltvError::DownloadError(format!("Failed to fetch URL: {}", e)))?;

    if !response.status().is_success() {
        return Err(XmltvError::DownloadError(format!(
            "HTTP error: {}",
            response.status()
        )));
    }

    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let content_encoding = response
        .headers()
        .get("content-encoding")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let is_gzip_header = content_type.contains("gzip")
        || content_type.contains("application/x-gzip")
        || content_encoding.contains("gzip");

    let data = response
        .bytes()
        .await
        .map_err(|e| XmltvError::DownloadError(format!("Failed to read response body: {}", e)))?
        .to_vec();

    // Magic bytes win over headers; some servers mislabel .xml.gz files.
    if detect_gzip(&data) {
        return decompress_gzip(&data);
    }
    if is_gzip_header {
        tracing::debug!(url, "content-type suggests gzip but magic bytes disagree, using raw body");
    }

    Ok(data)
}

/// Detect gzip compression from magic bytes.
pub fn detect_gzip(data: &[u8]) -> bool {
    data.len() >= 2 && data[0] == 0x1f && data[1] == 0x8b
}

/// Decompress gzip data.
pub fn decompress_gzip(compressed: &[u8]) -> Result<Vec<u8>, XmltvError> {
    let mut decoder = GzDecoder::new(compressed);
    let mut decompressed = Vec::new();

    decoder
        .read_to_end(&mut decompressed)
        .map_err(|e| XmltvError::DecompressError(format!("Gzip decompression failed: {}", e)))?;

    Ok(decompressed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gzip_detection() {
        let gzip_data = vec![0x1f, 0x8b, 0x08, 0x00];
        assert!(detect_gzip(&gzip_data));

        let plain_data = b"<?xml version";
        assert!(!detect_gzip(plain_data));

        assert!(!detect_gzip(&[0x1f]));
        assert!(!detect_gzip(&[]));
    }

    #[test]
    fn test_decompress_gzip_round_trip() {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;

        let original = b"<?xml version=\"1.0\"?><tv></tv>";

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(original).unwrap();
        let compressed = encoder.finish().unwrap();

        assert!(detect_gzip(&compressed));
        let decompressed = decompress_gzip(&compressed).unwrap();
        assert_eq!(decompressed, original);
    }

    #[test]
    fn test_decompress_rejects_garbage() {
        let garbage = vec![0x1f, 0x8b, 0xff, 0xff, 0xff];
        assert!(decompress_gzip(&garbage).is_err());
    }
}
