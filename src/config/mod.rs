//! Environment configuration
//!
//! Every option is read from an `IMGPROXY_*` environment variable at
//! startup, with key/salt/preset files optionally supplied through CLI
//! flags. The struct is validated once and immutable afterwards.

use std::env;
use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};

use crate::options::Presets;
use crate::signature::SecurityKey;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub read_timeout: u64,
    pub write_timeout: u64,
    pub download_timeout: u64,
    pub concurrency: usize,
    pub max_clients: usize,
    pub ttl: u64,

    pub max_src_dimension: u32,
    pub max_src_resolution: u64,
    pub max_src_file_size: usize,
    pub max_animation_frames: usize,
    pub max_svg_check_bytes: usize,

    pub jpeg_progressive: bool,
    pub png_interlaced: bool,
    pub quality: u8,
    pub gzip_compression: u32,

    pub enable_webp_detection: bool,
    pub enforce_webp: bool,
    pub enable_client_hints: bool,
    pub use_linear_colorspace: bool,

    pub keys: Vec<SecurityKey>,
    pub salts: Vec<SecurityKey>,
    pub signature_size: usize,

    pub secret: String,
    pub allow_origin: String,
    pub user_agent: String,
    pub ignore_ssl_verification: bool,
    pub development_errors: bool,

    pub local_fs_root: String,
    pub s3_enabled: bool,
    pub s3_region: String,
    pub s3_endpoint: String,
    pub gcs_key: String,

    pub etag_enabled: bool,
    pub base_url: String,

    pub presets: Presets,

    pub watermark_data: String,
    pub watermark_path: String,
    pub watermark_url: String,
    pub watermark_opacity: f64,

    pub download_buffer_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bind: ":8080".to_string(),
            read_timeout: 10,
            write_timeout: 10,
            download_timeout: 5,
            concurrency: num_cpus::get() * 2,
            max_clients: 0,
            ttl: 3600,
            max_src_dimension: 0,
            max_src_resolution: 16_800_000,
            max_src_file_size: 0,
            max_animation_frames: 1,
            max_svg_check_bytes: 32 * 1024,
            jpeg_progressive: false,
            png_interlaced: false,
            quality: 80,
            gzip_compression: 5,
            enable_webp_detection: false,
            enforce_webp: false,
            enable_client_hints: false,
            use_linear_colorspace: false,
            keys: Vec::new(),
            salts: Vec::new(),
            signature_size: 32,
            secret: String::new(),
            allow_origin: String::new(),
            user_agent: format!("imgproxy/{}", VERSION),
            ignore_ssl_verification: false,
            development_errors: false,
            local_fs_root: String::new(),
            s3_enabled: false,
            s3_region: String::new(),
            s3_endpoint: String::new(),
            gcs_key: String::new(),
            etag_enabled: false,
            base_url: String::new(),
            presets: Presets::default(),
            watermark_data: String::new(),
            watermark_path: String::new(),
            watermark_url: String::new(),
            watermark_opacity: 1.0,
            download_buffer_size: 0,
        }
    }
}

fn str_env(target: &mut String, name: &str) {
    if let Ok(value) = env::var(name) {
        if !value.is_empty() {
            *target = value;
        }
    }
}

fn int_env<T: std::str::FromStr>(target: &mut T, name: &str) {
    if let Ok(value) = env::var(name) {
        if let Ok(parsed) = value.parse() {
            *target = parsed;
        }
    }
}

fn float_env(target: &mut f64, name: &str) {
    if let Ok(value) = env::var(name) {
        if let Ok(parsed) = value.parse() {
            *target = parsed;
        }
    }
}

/// Fractional megapixel values like `2.5` become `2_500_000`.
fn mega_int_env(target: &mut u64, name: &str) {
    if let Ok(value) = env::var(name) {
        if let Ok(parsed) = value.parse::<f64>() {
            *target = (parsed * 1_000_000.0) as u64;
        }
    }
}

fn bool_env(target: &mut bool, name: &str) {
    if let Ok(value) = env::var(name) {
        *target = matches!(value.as_str(), "1" | "t" | "T" | "true" | "TRUE" | "True");
    }
}

fn hex_decode(s: &str) -> Result<SecurityKey> {
    if s.len() % 2 != 0 {
        bail!("odd-length hex string: {}", s);
    }
    (0..s.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&s[i..i + 2], 16).with_context(|| format!("invalid hex: {}", s))
        })
        .collect()
}

fn hex_env(target: &mut Vec<SecurityKey>, name: &str) -> Result<()> {
    if let Ok(value) = env::var(name) {
        if !value.is_empty() {
            let keys = value
                .split(',')
                .map(hex_decode)
                .collect::<Result<Vec<_>>>()
                .with_context(|| format!("{} expected to be hex-encoded strings", name))?;
            *target = keys;
        }
    }
    Ok(())
}

fn hex_file(target: &mut Vec<SecurityKey>, path: &str) -> Result<()> {
    if path.is_empty() {
        return Ok(());
    }
    let content = fs::read_to_string(path).with_context(|| format!("can't open file {}", path))?;
    let mut keys = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        keys.push(
            hex_decode(line)
                .with_context(|| format!("{} expected to contain hex-encoded strings", path))?,
        );
    }
    *target = keys;
    Ok(())
}

fn preset_env(presets: &mut Presets, name: &str) -> Result<()> {
    if let Ok(value) = env::var(name) {
        if !value.is_empty() {
            for preset in value.split(',') {
                presets
                    .insert_line(preset)
                    .with_context(|| format!("invalid preset in {}", name))?;
            }
        }
    }
    Ok(())
}

fn preset_file(presets: &mut Presets, path: &str) -> Result<()> {
    if path.is_empty() {
        return Ok(());
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("can't open presets file {}", path))?;
    for line in content.lines() {
        presets
            .insert_line(line)
            .with_context(|| format!("invalid preset in {}", path))?;
    }
    Ok(())
}

impl Config {
    /// Loads from the environment plus the optional key/salt/presets
    /// file paths supplied on the command line, then validates.
    pub fn from_env(key_path: &str, salt_path: &str, presets_path: &str) -> Result<Config> {
        let mut conf = Config::default();

        if let Ok(port) = env::var("PORT") {
            if !port.is_empty() {
                conf.bind = format!(":{}", port);
            }
        }

        str_env(&mut conf.bind, "IMGPROXY_BIND");
        int_env(&mut conf.read_timeout, "IMGPROXY_READ_TIMEOUT");
        int_env(&mut conf.write_timeout, "IMGPROXY_WRITE_TIMEOUT");
        int_env(&mut conf.download_timeout, "IMGPROXY_DOWNLOAD_TIMEOUT");
        int_env(&mut conf.concurrency, "IMGPROXY_CONCURRENCY");
        int_env(&mut conf.max_clients, "IMGPROXY_MAX_CLIENTS");
        int_env(&mut conf.ttl, "IMGPROXY_TTL");

        int_env(&mut conf.max_src_dimension, "IMGPROXY_MAX_SRC_DIMENSION");
        mega_int_env(&mut conf.max_src_resolution, "IMGPROXY_MAX_SRC_RESOLUTION");
        int_env(&mut conf.max_src_file_size, "IMGPROXY_MAX_SRC_FILE_SIZE");
        int_env(&mut conf.max_animation_frames, "IMGPROXY_MAX_GIF_FRAMES");
        int_env(&mut conf.max_animation_frames, "IMGPROXY_MAX_ANIMATION_FRAMES");
        int_env(&mut conf.max_svg_check_bytes, "IMGPROXY_MAX_SVG_CHECK_BYTES");

        bool_env(&mut conf.jpeg_progressive, "IMGPROXY_JPEG_PROGRESSIVE");
        bool_env(&mut conf.png_interlaced, "IMGPROXY_PNG_INTERLACED");
        int_env(&mut conf.quality, "IMGPROXY_QUALITY");
        int_env(&mut conf.gzip_compression, "IMGPROXY_GZIP_COMPRESSION");

        bool_env(&mut conf.enable_webp_detection, "IMGPROXY_ENABLE_WEBP_DETECTION");
        bool_env(&mut conf.enforce_webp, "IMGPROXY_ENFORCE_WEBP");
        bool_env(&mut conf.enable_client_hints, "IMGPROXY_ENABLE_CLIENT_HINTS");
        bool_env(&mut conf.use_linear_colorspace, "IMGPROXY_USE_LINEAR_COLORSPACE");

        hex_env(&mut conf.keys, "IMGPROXY_KEY")?;
        hex_env(&mut conf.salts, "IMGPROXY_SALT")?;
        int_env(&mut conf.signature_size, "IMGPROXY_SIGNATURE_SIZE");

        hex_file(&mut conf.keys, key_path)?;
        hex_file(&mut conf.salts, salt_path)?;

        str_env(&mut conf.secret, "IMGPROXY_SECRET");
        str_env(&mut conf.allow_origin, "IMGPROXY_ALLOW_ORIGIN");
        str_env(&mut conf.user_agent, "IMGPROXY_USER_AGENT");
        bool_env(&mut conf.ignore_ssl_verification, "IMGPROXY_IGNORE_SSL_VERIFICATION");
        bool_env(&mut conf.development_errors, "IMGPROXY_DEVELOPMENT_ERRORS");

        str_env(&mut conf.local_fs_root, "IMGPROXY_LOCAL_FILESYSTEM_ROOT");
        bool_env(&mut conf.s3_enabled, "IMGPROXY_USE_S3");
        str_env(&mut conf.s3_region, "IMGPROXY_S3_REGION");
        str_env(&mut conf.s3_endpoint, "IMGPROXY_S3_ENDPOINT");
        str_env(&mut conf.gcs_key, "IMGPROXY_GCS_KEY");

        bool_env(&mut conf.etag_enabled, "IMGPROXY_USE_ETAG");
        str_env(&mut conf.base_url, "IMGPROXY_BASE_URL");

        preset_env(&mut conf.presets, "IMGPROXY_PRESETS")?;
        preset_file(&mut conf.presets, presets_path)?;

        str_env(&mut conf.watermark_data, "IMGPROXY_WATERMARK_DATA");
        str_env(&mut conf.watermark_path, "IMGPROXY_WATERMARK_PATH");
        str_env(&mut conf.watermark_url, "IMGPROXY_WATERMARK_URL");
        float_env(&mut conf.watermark_opacity, "IMGPROXY_WATERMARK_OPACITY");

        int_env(&mut conf.download_buffer_size, "IMGPROXY_DOWNLOAD_BUFFER_SIZE");

        conf.validate()?;
        Ok(conf)
    }

    pub fn validate(&mut self) -> Result<()> {
        if self.keys.len() != self.salts.len() {
            bail!(
                "number of keys and number of salts should be equal. Keys: {}, salts: {}",
                self.keys.len(),
                self.salts.len()
            );
        }
        if self.keys.is_empty() {
            tracing::warn!("no keys defined, so signature checking is disabled");
        }

        if self.signature_size < 1 || self.signature_size > 32 {
            bail!("signature size should be within 1 and 32, now - {}", self.signature_size);
        }

        if self.bind.is_empty() {
            bail!("bind address is not defined");
        }
        if self.read_timeout == 0 {
            bail!("read timeout should be greater than 0");
        }
        if self.write_timeout == 0 {
            bail!("write timeout should be greater than 0");
        }
        if self.download_timeout == 0 {
            bail!("download timeout should be greater than 0");
        }
        if self.concurrency == 0 {
            bail!("concurrency should be greater than 0");
        }
        if self.max_clients == 0 {
            self.max_clients = self.concurrency * 10;
        }
        if self.ttl == 0 {
            bail!("TTL should be greater than 0");
        }

        if self.max_src_dimension > 0 {
            tracing::warn!(
                "IMGPROXY_MAX_SRC_DIMENSION is deprecated, use IMGPROXY_MAX_SRC_RESOLUTION"
            );
        }
        if self.max_src_resolution == 0 {
            bail!("max src resolution should be greater than 0");
        }
        if self.max_animation_frames == 0 {
            bail!("max animation frames should be greater than 0");
        }

        if self.quality == 0 || self.quality > 100 {
            bail!("quality should be within 1 and 100, now - {}", self.quality);
        }
        if self.gzip_compression > 9 {
            bail!("gzip compression can't be greater than 9, now - {}", self.gzip_compression);
        }

        if self.ignore_ssl_verification {
            tracing::warn!("ignoring SSL verification is very unsafe");
        }

        if !self.local_fs_root.is_empty() {
            let path = Path::new(&self.local_fs_root);
            let stat = fs::metadata(path)
                .with_context(|| format!("cannot use local directory: {}", self.local_fs_root))?;
            if !stat.is_dir() {
                bail!("cannot use local directory: not a directory");
            }
            if self.local_fs_root == "/" {
                tracing::warn!("exposing root via IMGPROXY_LOCAL_FILESYSTEM_ROOT is unsafe");
            }
        }

        self.presets
            .validate(self.quality)
            .map_err(|e| anyhow::anyhow!(e.internal_message()))?;

        let watermark_sources = [&self.watermark_data, &self.watermark_path, &self.watermark_url]
            .iter()
            .filter(|s| !s.is_empty())
            .count();
        if watermark_sources > 1 {
            bail!("only one watermark source can be set at once");
        }
        if self.watermark_opacity <= 0.0 || self.watermark_opacity > 1.0 {
            bail!("watermark opacity should be within (0, 1]");
        }

        Ok(())
    }

    /// `:8080` style binds resolve against all interfaces.
    pub fn bind_addr(&self) -> String {
        if let Some(port) = self.bind.strip_prefix(':') {
            format!("0.0.0.0:{}", port)
        } else {
            self.bind.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let conf = Config::default();
        assert_eq!(conf.bind, ":8080");
        assert_eq!(conf.quality, 80);
        assert_eq!(conf.max_src_resolution, 16_800_000);
        assert_eq!(conf.signature_size, 32);
        assert_eq!(conf.concurrency, num_cpus::get() * 2);
        assert_eq!(conf.watermark_opacity, 1.0);
    }

    #[test]
    fn test_validate_fills_max_clients() {
        let mut conf = Config::default();
        conf.concurrency = 4;
        conf.max_clients = 0;
        conf.validate().unwrap();
        assert_eq!(conf.max_clients, 40);
    }

    #[test]
    fn test_validate_rejects_key_salt_mismatch() {
        let mut conf = Config::default();
        conf.keys = vec![vec![1, 2]];
        conf.salts = vec![];
        assert!(conf.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_signature_size() {
        let mut conf = Config::default();
        conf.signature_size = 0;
        assert!(conf.validate().is_err());
        conf.signature_size = 33;
        assert!(conf.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_quality() {
        let mut conf = Config::default();
        conf.quality = 0;
        assert!(conf.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_two_watermark_sources() {
        let mut conf = Config::default();
        conf.watermark_data = "aGk".to_string();
        conf.watermark_path = "/tmp/wm.png".to_string();
        assert!(conf.validate().is_err());
    }

    #[test]
    fn test_hex_decode() {
        assert_eq!(hex_decode("00ff10").unwrap(), vec![0x00, 0xff, 0x10]);
        assert!(hex_decode("0").is_err());
        assert!(hex_decode("zz").is_err());
    }

    #[test]
    fn test_bind_addr() {
        let mut conf = Config::default();
        assert_eq!(conf.bind_addr(), "0.0.0.0:8080");
        conf.bind = "127.0.0.1:9000".to_string();
        assert_eq!(conf.bind_addr(), "127.0.0.1:9000");
    }
}
