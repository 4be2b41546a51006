use anyhow::{Context, Result, anyhow};
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageReader};
use std::env;
use std::fs;
use std::future::Future;
use std::io::Cursor;
use std::path::Path;
use std::pin::Pin;
use tempfile::tempdir;
use tokio::process::Command;
use tracing::debug;

use crate::data::{self, SourceKind};
use crate::task::{PagePreview, SourceFile};

const PDF_BASE_DPI: f32 = 72.0;

pub type PreviewFuture<'a> = Pin<Box<dyn Future<Output = Result<PagePreview>> + Send + 'a>>;

/// Produces the page-1 image that is shown to the user and sent for analysis.
pub trait PreviewRenderer: Send + Sync {
    fn render<'a>(&'a self, source: &'a SourceFile) -> PreviewFuture<'a>;
}

/// Passes images through and rasterizes PDFs with `mutool` or `pdftoppm`.
#[derive(Debug, Clone, Copy)]
pub struct CommandRasterizer {
    pdf_scale: f32,
    jpeg_quality: u8,
}

impl Default for CommandRasterizer {
    fn default() -> Self {
        Self::new(2.0, 95)
    }
}

impl CommandRasterizer {
    pub fn new(pdf_scale: f32, jpeg_quality: u8) -> Self {
        let pdf_scale = if pdf_scale.is_finite() && pdf_scale > 0.0 {
            pdf_scale
        } else {
            2.0
        };
        Self {
            pdf_scale,
            jpeg_quality: jpeg_quality.clamp(1, 100),
        }
    }

    fn dpi(&self) -> u32 {
        (PDF_BASE_DPI * self.pdf_scale).round().max(1.0) as u32
    }
}

impl PreviewRenderer for CommandRasterizer {
    fn render<'a>(&'a self, source: &'a SourceFile) -> PreviewFuture<'a> {
        Box::pin(async move {
            let bytes = tokio::fs::read(&source.path)
                .await
                .with_context(|| format!("failed to read {}", source.path.display()))?;
            let mime = data::resolve_mime(&bytes, Some(&source.path))?;
            match data::source_kind(&mime) {
                Some(SourceKind::Image) => {
                    let preview = match image_dimensions(&bytes) {
                        Some((width, height)) => {
                            PagePreview::new(bytes, mime).with_dimensions(width, height)
                        }
                        None => PagePreview::new(bytes, mime),
                    };
                    Ok(preview)
                }
                Some(SourceKind::Pdf) => {
                    rasterize_first_page(&bytes, self.dpi(), self.jpeg_quality).await
                }
                None => Err(anyhow!("unsupported file type: {}", mime)),
            }
        })
    }
}

fn image_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .ok()?
        .into_dimensions()
        .ok()
}

/// The child process is killed if the returned future is dropped.
async fn rasterize_first_page(pdf_bytes: &[u8], dpi: u32, quality: u8) -> Result<PagePreview> {
    let dir = tempdir().with_context(|| "failed to create temp dir for pdf")?;
    let input_path = dir.path().join("input.pdf");
    tokio::fs::write(&input_path, pdf_bytes)
        .await
        .with_context(|| "failed to write temp pdf")?;
    let output_path = dir.path().join("page.png");

    let (tool, mut command) = if command_exists("mutool") {
        let mut command = Command::new("mutool");
        command
            .arg("draw")
            .arg("-r")
            .arg(dpi.to_string())
            .arg("-o")
            .arg(&output_path)
            .arg(&input_path)
            .arg("1");
        ("mutool", command)
    } else if command_exists("pdftoppm") {
        let mut command = Command::new("pdftoppm");
        command
            .arg("-png")
            .arg("-r")
            .arg(dpi.to_string())
            .arg("-f")
            .arg("1")
            .arg("-l")
            .arg("1")
            .arg("-singlefile")
            .arg(&input_path)
            .arg(dir.path().join("page"));
        ("pdftoppm", command)
    } else {
        return Err(anyhow!(
            "pdf rendering requires mutool or pdftoppm (install mupdf or poppler)"
        ));
    };
    let output = command
        .kill_on_drop(true)
        .output()
        .await
        .with_context(|| format!("failed to run {}", tool))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(anyhow!("{} failed: {}", tool, stderr.trim()));
    }

    let png = tokio::fs::read(&output_path)
        .await
        .with_context(|| "failed to read rendered pdf page")?;
    tokio::task::spawn_blocking(move || -> Result<PagePreview> {
        let page =
            image::load_from_memory(&png).with_context(|| "failed to decode rendered page")?;
        debug!("rasterized pdf page at {} dpi ({}x{})", dpi, page.width(), page.height());
        let jpeg = encode_jpeg(&page, quality)?;
        Ok(PagePreview::new(jpeg, data::JPEG_MIME).with_dimensions(page.width(), page.height()))
    })
    .await
    .with_context(|| "jpeg encoder task failed")?
}

fn encode_jpeg(image: &DynamicImage, quality: u8) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality)
        .encode_image(&image.to_rgb8())
        .with_context(|| "failed to encode jpeg preview")?;
    Ok(out)
}

fn command_exists(cmd: &str) -> bool {
    let Some(path_var) = env::var_os("PATH") else {
        return false;
    };
    env::split_paths(&path_var).any(|dir| {
        let candidate = dir.join(cmd);
        is_executable(&candidate)
            || (cfg!(windows) && is_executable(&candidate.with_extension("exe")))
    })
}

fn is_executable(path: &Path) -> bool {
    let Ok(metadata) = fs::metadata(path) else {
        return false;
    };
    if !metadata.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}
