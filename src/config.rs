use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// EPUB to PDF conversion service.
#[derive(Parser, Debug, Clone)]
#[command(name = "epub2pdf")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to config file.
    #[arg(short, long, env = "EPUB2PDF_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Subcommand to run.
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// CLI subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Start the server (default if no command given).
    Serve {
        /// Address to bind the server to.
        #[arg(short, long)]
        bind: Option<SocketAddr>,
    },

    /// Convert one EPUB file to PDF.
    Convert {
        /// EPUB file to convert.
        input: PathBuf,

        /// Output PDF path (defaults to the input with a .pdf extension).
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Write the synthesized HTML to this file.
        #[arg(long)]
        snapshot: Option<PathBuf>,
    },

    /// Create a default config file.
    Init {
        /// Force overwrite existing config.
        #[arg(short, long)]
        force: bool,
    },
}

/// Main configuration from TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Upload validation.
    #[serde(default)]
    pub upload: UploadConfig,

    /// Conversion options.
    #[serde(default)]
    pub convert: ConvertConfig,

    /// Debug snapshot options.
    #[serde(default)]
    pub debug: DebugConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to.
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,

    /// Application title.
    #[serde(default = "default_title")]
    pub title: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            title: default_title(),
        }
    }
}

fn default_bind() -> SocketAddr {
    SocketAddr::new(
        std::net::IpAddr::V4(std::net::Ipv4Addr::new(0, 0, 0, 0)),
        7860,
    )
}

fn default_title() -> String {
    "EPUB to PDF Converter".to_string()
}

/// Upload validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Maximum upload size in megabytes.
    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: u64,

    /// Accepted content types; others are accepted with a warning.
    #[serde(default = "default_allowed_mime_types")]
    pub allowed_mime_types: Vec<String>,

    /// Accepted file extensions, with the leading dot.
    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_size_mb: default_max_size_mb(),
            allowed_mime_types: default_allowed_mime_types(),
            allowed_extensions: default_allowed_extensions(),
        }
    }
}

fn default_max_size_mb() -> u64 {
    50
}

fn default_allowed_mime_types() -> Vec<String> {
    vec![
        "application/epub+zip".to_string(),
        "application/zip".to_string(),
    ]
}

fn default_allowed_extensions() -> Vec<String> {
    vec![".epub".to_string()]
}

impl UploadConfig {
    /// Maximum upload size in bytes.
    pub fn max_size_bytes(&self) -> u64 {
        self.max_size_mb.saturating_mul(1024 * 1024)
    }

    /// Whether the file name carries an allowed extension.
    pub fn extension_allowed(&self, file_name: &str) -> bool {
        let lower = file_name.to_ascii_lowercase();
        self.allowed_extensions
            .iter()
            .any(|ext| lower.ends_with(&ext.to_ascii_lowercase()))
    }

    /// Whether the content type is one of the allowed ones.
    pub fn mime_allowed(&self, content_type: &str) -> bool {
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim();
        self.allowed_mime_types
            .iter()
            .any(|m| m.eq_ignore_ascii_case(essence))
    }
}

/// Conversion options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvertConfig {
    /// Unmarked blocks shorter than this may become headings.
    #[serde(default = "default_heading_max_chars")]
    pub heading_max_chars: usize,

    /// Level of detected headings.
    #[serde(default = "default_heading_level")]
    pub heading_level: u8,

    /// Detect headings in documents without heading markup.
    #[serde(default = "default_true")]
    pub heading_heuristic: bool,

    /// Put the book title and author at the top of the first page.
    #[serde(default = "default_true")]
    pub title_block: bool,

    /// JPEG quality of embedded images (1-100).
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,

    /// TrueType fonts tried after those shipped in the book, in order.
    #[serde(default = "default_fonts")]
    pub fonts: Vec<PathBuf>,
}

impl Default for ConvertConfig {
    fn default() -> Self {
        Self {
            heading_max_chars: default_heading_max_chars(),
            heading_level: default_heading_level(),
            heading_heuristic: true,
            title_block: true,
            jpeg_quality: default_jpeg_quality(),
            fonts: default_fonts(),
        }
    }
}

fn default_heading_max_chars() -> usize {
    100
}

fn default_heading_level() -> u8 {
    2
}

fn default_true() -> bool {
    true
}

fn default_jpeg_quality() -> u8 {
    85
}

fn default_fonts() -> Vec<PathBuf> {
    crate::convert::DEFAULT_FONT_PATHS
        .iter()
        .map(PathBuf::from)
        .collect()
}

/// Debug snapshot options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebugConfig {
    /// Write the synthesized HTML of every conversion.
    #[serde(default = "default_true")]
    pub snapshot: bool,

    /// Snapshot file, overwritten by every conversion.
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: PathBuf,

    /// Characters returned in the debug info preview.
    #[serde(default = "default_preview_chars")]
    pub preview_chars: usize,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            snapshot: true,
            snapshot_path: default_snapshot_path(),
            preview_chars: default_preview_chars(),
        }
    }
}

fn default_snapshot_path() -> PathBuf {
    PathBuf::from(crate::convert::snapshot::DEFAULT_SNAPSHOT_PATH)
}

fn default_preview_chars() -> usize {
    500
}

impl Config {
    /// Load configuration from file.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            crate::error::AppError::Config(format!("Failed to read config file: {}", e))
        })?;

        Self::parse(&content)
    }

    /// Parse configuration from TOML text.
    pub fn parse(content: &str) -> crate::error::Result<Self> {
        toml::from_str(content).map_err(|e| {
            crate::error::AppError::Config(format!("Failed to parse config file: {}", e))
        })
    }

    /// Find config file in default locations.
    pub fn find_config_file() -> Option<PathBuf> {
        let candidates = [
            PathBuf::from("config.toml"),
            PathBuf::from("epub2pdf.toml"),
            dirs::config_dir()
                .map(|p| p.join("epub2pdf").join("config.toml"))
                .unwrap_or_default(),
            PathBuf::from("/etc/epub2pdf/config.toml"),
        ];

        candidates
            .into_iter()
            .find(|p| !p.as_os_str().is_empty() && p.exists())
    }

    /// Generate default config file content.
    pub fn generate_default() -> String {
        r#"# epub2pdf configuration

[server]
bind = "0.0.0.0:7860"
title = "EPUB to PDF Converter"

[upload]
# Maximum upload size in megabytes
max_size_mb = 50
# Other content types are accepted with a warning if the extension matches
allowed_mime_types = ["application/epub+zip", "application/zip"]
allowed_extensions = [".epub"]

[convert]
# Heading detection for books without h1-h6 markup
heading_heuristic = true
heading_max_chars = 100
heading_level = 2
# Title and author at the top of the first page
title_block = true
jpeg_quality = 85
# TrueType fonts (.ttf or .ttc); the first one covering a character wins
fonts = [
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/truetype/dejavu/DejaVuSans-Bold.ttf",
    "/usr/share/fonts/truetype/dejavu/DejaVuSans-Oblique.ttf",
    "/usr/share/fonts/truetype/dejavu/DejaVuSans-BoldOblique.ttf",
    "/usr/share/fonts/truetype/wqy/wqy-microhei.ttc",
    "/usr/share/fonts/truetype/wqy/wqy-zenhei.ttc",
]

[debug]
# Keep the HTML of the last conversion for inspection
snapshot = true
snapshot_path = "/tmp/debug.html"
preview_chars = 500
"#
        .to_string()
    }
}
