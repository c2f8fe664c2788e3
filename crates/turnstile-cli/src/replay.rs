//! Folder replay: feed a directory of still images to `/match` as if they
//! were camera frames.
//!
//! Every frame is re-encoded to JPEG, matched, appended to a local CSV log,
//! and reported to `/events` (as the matched name, or `unknown`). A failing
//! frame is logged and skipped; the loop keeps going.

use crate::client::ApiClient;
use anyhow::{bail, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use rand::seq::SliceRandom;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];
const JPEG_QUALITY: u8 = 90;
const LOG_HEADER: &str = "ts,camera,image,best_name,best_score,match,thr";

pub struct ReplayOptions {
    pub folder: PathBuf,
    pub camera: String,
    pub thr: f32,
    pub interval: Duration,
    pub repeat: bool,
    pub shuffle: bool,
    pub log_path: PathBuf,
}

/// One client-side log row.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameRecord {
    pub ts: String,
    pub camera: String,
    pub image: String,
    pub best_name: String,
    pub best_score: f64,
    pub is_match: bool,
    pub thr: f32,
}

impl FrameRecord {
    fn csv_row(&self) -> String {
        let score = format!("{:.3}", self.best_score);
        let thr = format!("{:.2}", self.thr);
        let fields = [
            self.ts.as_str(),
            self.camera.as_str(),
            self.image.as_str(),
            self.best_name.as_str(),
            score.as_str(),
            if self.is_match { "1" } else { "0" },
            thr.as_str(),
        ];
        let mut row = fields.iter().map(|f| csv_field(f)).collect::<Vec<_>>().join(",");
        row.push_str("\r\n");
        row
    }
}

fn csv_field(field: &str) -> String {
    if field.contains(&[',', '"', '\r', '\n'][..]) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Append `record` to the CSV at `path`, writing the header first if the
/// file is new.
pub fn append_log(path: &Path, record: &FrameRecord) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    let is_new = !path.exists();
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening {}", path.display()))?;
    if is_new {
        write!(file, "{LOG_HEADER}\r\n")?;
    }
    file.write_all(record.csv_row().as_bytes())?;
    Ok(())
}

/// Images directly inside `folder`, sorted by path.
pub fn collect_images(folder: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(folder)
        .with_context(|| format!("folder not found: {}", folder.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file())
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        })
        .collect();
    files.sort();
    Ok(files)
}

/// Decode any supported image file and re-encode it as JPEG.
pub fn to_jpeg(path: &Path) -> Result<Vec<u8>> {
    let rgb = image::open(path)
        .with_context(|| format!("decoding {}", path.display()))?
        .to_rgb8();
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY)
        .encode_image(&rgb)
        .with_context(|| format!("encoding {}", path.display()))?;
    Ok(out)
}

pub async fn run(client: &ApiClient, opts: &ReplayOptions) -> Result<()> {
    let files = collect_images(&opts.folder)?;
    if files.is_empty() {
        bail!("no images found in {}", opts.folder.display());
    }

    println!(
        "sending {} images from {} (thr={}, interval={:?}, camera={})",
        files.len(),
        opts.folder.display(),
        opts.thr,
        opts.interval,
        opts.camera
    );

    loop {
        let mut batch = files.clone();
        if opts.shuffle {
            batch.shuffle(&mut rand::thread_rng());
        }
        for path in &batch {
            if let Err(err) = process_frame(client, opts, path).await {
                tracing::warn!(
                    image = %path.display(),
                    error = %format!("{err:#}"),
                    "frame failed"
                );
            }
            tokio::time::sleep(opts.interval).await;
        }
        if !opts.repeat {
            return Ok(());
        }
    }
}

async fn process_frame(client: &ApiClient, opts: &ReplayOptions, path: &Path) -> Result<()> {
    let ts = chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
    let image_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let jpeg = to_jpeg(path)?;
    let reply = client.match_image(jpeg, opts.thr, &opts.camera).await?;
    let best = &reply.best;

    println!(
        "{} {:30} -> {:12}  score={:.3}  thr={}  cam={}",
        if best.is_match { "MATCH" } else { "miss " },
        image_name,
        best.name,
        best.score,
        opts.thr,
        opts.camera
    );

    append_log(
        &opts.log_path,
        &FrameRecord {
            ts,
            camera: opts.camera.clone(),
            image: image_name,
            best_name: best.name.clone(),
            best_score: best.score,
            is_match: best.is_match,
            thr: opts.thr,
        },
    )?;

    let person = if best.is_match { best.name.as_str() } else { "unknown" };
    if let Err(err) = client.post_event(person, best.score, &opts.camera, None).await {
        tracing::warn!(person, error = %err, "could not record event");
    }
    Ok(())
}
