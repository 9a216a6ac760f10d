use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{ArgAction, Args, Parser, Subcommand};
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use log::{debug, error, info, warn};
use rand::Rng;
use resvg::{tiny_skia, usvg};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::VecDeque;
use std::env;
use std::fs;
use std::io::{self, Cursor};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use wait_timeout::ChildExt;

const DEFAULT_PLAYER: &str = "Spotify";
const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;
const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 3000;
const DEFAULT_SCALE_FACTOR: f32 = 2.0;

const CACHE_CAPACITY: usize = 5;
const OUTPUT_PREFIX: &str = "nowpaper-";

// Layout constants are expressed at a 512 px tall reference screen and scaled
// linearly to the actual pixel height.
const BASE_HEIGHT: f64 = 512.0;
const THUMBNAIL_SIZE: f64 = 192.0;
const LEFT_MARGIN: f64 = 48.0;
const TEXT_GAP: f64 = 40.0;
const RIGHT_MARGIN: f64 = 48.0;
const TITLE_FONT_SIZE: f64 = 40.0;
const ARTIST_FONT_SIZE: f64 = 28.0;
const TITLE_BASELINE_RISE: f64 = 12.0;
const ARTIST_BASELINE_DROP: f64 = 34.0;
const GLYPH_WIDTH_RATIO: f64 = 0.55;
const MIN_TEXT_SHRINK: f64 = 0.5;
const TEXT_FONT_FAMILY: &str = "Helvetica Neue, Helvetica, Arial, sans-serif";

const BACKDROP_SUPERSAMPLE: u32 = 2;
const BACKDROP_BLUR_SIGMA: f32 = 40.0;
const BACKDROP_BRIGHTNESS: f64 = 0.65;
const BACKDROP_SATURATION: f64 = 1.2;
const BACKDROP_SHADE_ALPHA: f64 = 0.25;
const THUMBNAIL_SHARPEN_SIGMA: f32 = 1.4;
const THUMBNAIL_SHARPEN_THRESHOLD: i32 = 4;

const OSASCRIPT_TIMEOUT_MS: u64 = 2000;
const HTTP_TIMEOUT_SECS: u64 = 10;
const HTTP_USER_AGENT: &str = concat!("nowpaper/", env!("CARGO_PKG_VERSION"));

const AGENT_LABEL: &str = "io.nowpaper.agent";

#[derive(Parser, Debug)]
#[command(
    name = "nowpaper",
    version,
    about = "Mirror the currently playing track onto the macOS desktop wallpaper"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Watch the player and keep the wallpaper in sync (foreground daemon)
    Run(RunArgs),
    /// Print the current playback state as JSON
    Status(StatusArgs),
    /// Compose one wallpaper for the current track without installing it
    Preview(PreviewArgs),
    /// Manage the login LaunchAgent
    #[command(subcommand)]
    Agent(AgentCommand),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Poll interval in milliseconds
    #[arg(long)]
    interval_ms: Option<u64>,
    /// Media player application name
    #[arg(long)]
    player: Option<String>,
    /// Directory for generated wallpaper files
    #[arg(long)]
    work_dir: Option<PathBuf>,
    /// Config file path (default: ~/.config/nowpaper/config.json)
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct StatusArgs {
    /// Media player application name
    #[arg(long)]
    player: Option<String>,
    /// Config file path
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct PreviewArgs {
    /// Output PNG path (default: a fresh file in the working directory)
    #[arg(long)]
    out: Option<PathBuf>,
    /// Media player application name
    #[arg(long)]
    player: Option<String>,
    /// Config file path
    #[arg(long)]
    config: Option<PathBuf>,
    /// Print the result payload as JSON
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,
}

#[derive(Subcommand, Debug)]
enum AgentCommand {
    /// Register the daemon as a login LaunchAgent
    Install,
    /// Unload and remove the LaunchAgent
    Uninstall,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => command_run(args),
        Commands::Status(args) => command_status(args),
        Commands::Preview(args) => command_preview(args),
        Commands::Agent(cmd) => command_agent(cmd),
    }
}

fn command_run(args: RunArgs) -> Result<()> {
    let mut config = Config::load(args.config.as_deref());
    if let Some(interval) = args.interval_ms {
        config.poll_interval_ms = interval;
    }
    if let Some(player) = args.player {
        config.player = player;
    }
    if let Some(work_dir) = args.work_dir {
        config.work_dir = Some(work_dir);
    }
    if config.poll_interval_ms == 0 {
        bail!("poll interval must be at least 1 ms");
    }
    if !cfg!(target_os = "macos") {
        bail!("the wallpaper daemon requires macOS");
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("start async runtime")?;
    runtime.block_on(run_daemon(config))
}

fn command_status(args: StatusArgs) -> Result<()> {
    let mut config = Config::load(args.config.as_deref());
    if let Some(player) = args.player {
        config.player = player;
    }
    let desk = MacDesk::new(&config);
    let payload = match desk.sample_now_playing()? {
        PlaybackSample::Playing(track) => json!({
            "state": "playing",
            "player": config.player,
            "artist": track.artist,
            "title": track.title,
            "artwork": track.artwork_url,
        }),
        PlaybackSample::NotPlaying => json!({ "state": "idle", "player": config.player }),
        PlaybackSample::PlayerNotRunning => json!({ "state": "closed", "player": config.player }),
    };
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}

fn command_preview(args: PreviewArgs) -> Result<()> {
    let mut config = Config::load(args.config.as_deref());
    if let Some(player) = args.player {
        config.player = player;
    }
    let desk = MacDesk::new(&config);
    let PlaybackSample::Playing(track) = desk.sample_now_playing()? else {
        bail!("nothing is playing");
    };
    let geometry = desk.screen_geometry()?;
    let bytes = desk.download_artwork(&track.artwork_url)?;
    let composed = compose_wallpaper(&bytes, &track, geometry, None)?;

    let out = args
        .out
        .unwrap_or_else(|| config.work_dir_path().join(unique_output_name()));
    ensure_parent_dir(&out)?;
    fs::write(&out, &composed.png).with_context(|| format!("write preview: {}", out.display()))?;

    if args.json {
        let payload = json!({
            "out": out.display().to_string(),
            "artist": track.artist,
            "title": track.title,
            "artwork": track.artwork_url,
            "width": geometry.width_px,
            "height": geometry.height_px,
            "scale": geometry.scale_factor,
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        println!("{}", out.display());
    }
    Ok(())
}

fn command_agent(cmd: AgentCommand) -> Result<()> {
    if !cfg!(target_os = "macos") {
        bail!("launch agents require macOS");
    }
    match cmd {
        AgentCommand::Install => agent_install(),
        AgentCommand::Uninstall => agent_uninstall(),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct Config {
    player: String,
    poll_interval_ms: u64,
    shutdown_grace_ms: u64,
    scale_factor: f32,
    work_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            player: DEFAULT_PLAYER.to_string(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            shutdown_grace_ms: DEFAULT_SHUTDOWN_GRACE_MS,
            scale_factor: DEFAULT_SCALE_FACTOR,
            work_dir: None,
        }
    }
}

impl Config {
    fn load(path: Option<&Path>) -> Config {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(default_config_path);
        match fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(config) => {
                    debug!("loaded config from {}", path.display());
                    config
                }
                Err(err) => {
                    warn!("ignoring malformed config {}: {err}", path.display());
                    Config::default()
                }
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => Config::default(),
            Err(err) => {
                warn!("could not read config {}: {err}", path.display());
                Config::default()
            }
        }
    }

    fn work_dir_path(&self) -> PathBuf {
        self.work_dir.clone().unwrap_or_else(default_work_dir)
    }
}

fn home_dir() -> PathBuf {
    env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn default_config_path() -> PathBuf {
    home_dir().join(".config").join("nowpaper").join("config.json")
}

fn default_work_dir() -> PathBuf {
    env::var("NOWPAPER_WORK_DIR")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| home_dir().join(".cache").join("nowpaper"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct TrackMetadata {
    artist: String,
    title: String,
    artwork_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PlaybackSample {
    Playing(TrackMetadata),
    NotPlaying,
    PlayerNotRunning,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct ScreenGeometry {
    width_px: u32,
    height_px: u32,
    scale_factor: f32,
}

impl ScreenGeometry {
    fn from_logical(width: f64, height: f64, scale_factor: f32) -> ScreenGeometry {
        let scale_factor = scale_factor.max(0.5);
        let scale = f64::from(scale_factor);
        ScreenGeometry {
            width_px: (width * scale).round().max(1.0) as u32,
            height_px: (height * scale).round().max(1.0) as u32,
            scale_factor,
        }
    }

    fn pixel_size(self) -> (u32, u32) {
        (self.width_px, self.height_px)
    }
}

// Featuring credits embedded in the title are moved over to the artist line.
// Markers are matched longest-first so "featuring" is not consumed as "feat".
const FEATURING_MARKERS: [&str; 9] = [
    "featuring", "feat", "ft", "with", "avec", "con", "mit", "w/", "c/",
];

/// Returns the text after a leading featuring marker, or None when `segment`
/// does not start with one. Plain-word markers need a `.` or space boundary so
/// titles like "Within You" survive.
fn strip_featuring_marker(segment: &str) -> Option<&str> {
    let trimmed = segment.trim_start();
    let lower = trimmed.to_lowercase();
    for marker in FEATURING_MARKERS {
        if !lower.starts_with(marker) {
            continue;
        }
        let rest = &trimmed[marker.len()..];
        if marker.ends_with('/') {
            return Some(rest.trim_start_matches([' ', '.']).trim());
        }
        match rest.chars().next() {
            Some('.') | Some(' ') => return Some(rest.trim_start_matches(['.', ' ']).trim()),
            _ => continue,
        }
    }
    None
}

fn split_grouped_featuring(title: &str) -> Option<(String, String)> {
    for (idx, ch) in title.char_indices() {
        let close = match ch {
            '(' => ')',
            '[' => ']',
            _ => continue,
        };
        let inner_start = idx + ch.len_utf8();
        let Some(rel_end) = title[inner_start..].find(close) else {
            continue;
        };
        let inner_end = inner_start + rel_end;
        let Some(names) = strip_featuring_marker(&title[inner_start..inner_end]) else {
            continue;
        };
        if names.is_empty() {
            continue;
        }
        let mut remain = title[..idx].trim_end().to_string();
        let after = title[inner_end + 1..].trim_start();
        if !after.is_empty() {
            if !remain.is_empty() {
                remain.push(' ');
            }
            remain.push_str(after);
        }
        return Some((remain.trim().to_string(), names.to_string()));
    }
    None
}

fn split_dashed_featuring(title: &str) -> Option<(String, String)> {
    for (idx, ch) in title.char_indices() {
        if !matches!(ch, '-' | '\u{2013}' | '\u{2014}') {
            continue;
        }
        // Only a free-standing dash separates a featuring tail; hyphenated
        // words pass through.
        if !title[..idx].ends_with(' ') {
            continue;
        }
        let rest = &title[idx + ch.len_utf8()..];
        if !rest.starts_with(' ') {
            continue;
        }
        let Some(names) = strip_featuring_marker(rest) else {
            continue;
        };
        if names.is_empty() {
            continue;
        }
        return Some((title[..idx].trim_end().to_string(), names.to_string()));
    }
    None
}

fn split_trailing_featuring(title: &str) -> Option<(String, String)> {
    let mut prev_is_space = false;
    for (idx, ch) in title.char_indices() {
        if prev_is_space && !ch.is_whitespace() {
            if let Some(names) = strip_featuring_marker(&title[idx..]) {
                let remain = title[..idx].trim_end();
                if !names.is_empty() && !remain.is_empty() {
                    return Some((remain.to_string(), names.to_string()));
                }
            }
        }
        prev_is_space = ch.is_whitespace();
    }
    None
}

/// Splits a featuring credit out of `title` and merges it into `artist`.
/// Exactly one pattern applies per call: a parenthesized or bracketed group
/// first, then a dash-delimited tail, then a bare marker before the end of
/// the title.
fn split_featuring(title: &str, artist: &str) -> (String, String) {
    let found = split_grouped_featuring(title)
        .or_else(|| split_dashed_featuring(title))
        .or_else(|| split_trailing_featuring(title));
    match found {
        Some((stripped, names)) if !names.is_empty() => {
            let artist = artist.trim();
            let merged = if artist.is_empty() {
                names
            } else {
                format!("{artist}, {names}")
            };
            (stripped, merged)
        }
        _ => (title.trim().to_string(), artist.trim().to_string()),
    }
}

fn escape_markup(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(ch),
        }
    }
    out
}

struct CacheSlot {
    identity: String,
    bytes: Option<Arc<Vec<u8>>>,
    backdrop: Option<((u32, u32), Arc<RgbaImage>)>,
}

/// Bounded in-memory artwork cache. Eviction is by first insertion order:
/// lookups and overwrites never refresh a slot's position.
struct ArtCache {
    slots: VecDeque<CacheSlot>,
    capacity: usize,
}

impl ArtCache {
    fn new(capacity: usize) -> ArtCache {
        ArtCache {
            slots: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn bytes(&self, identity: &str) -> Option<Arc<Vec<u8>>> {
        self.slots
            .iter()
            .find(|slot| slot.identity == identity)
            .and_then(|slot| slot.bytes.clone())
    }

    fn backdrop(&self, identity: &str, dims: (u32, u32)) -> Option<Arc<RgbaImage>> {
        self.slots
            .iter()
            .find(|slot| slot.identity == identity)
            .and_then(|slot| slot.backdrop.as_ref())
            .filter(|(cached_dims, _)| *cached_dims == dims)
            .map(|(_, image)| Arc::clone(image))
    }

    fn put_bytes(&mut self, identity: &str, bytes: Arc<Vec<u8>>) {
        self.slot_mut(identity).bytes = Some(bytes);
    }

    fn put_backdrop(&mut self, identity: &str, dims: (u32, u32), backdrop: Arc<RgbaImage>) {
        self.slot_mut(identity).backdrop = Some((dims, backdrop));
    }

    fn len(&self) -> usize {
        self.slots.len()
    }

    fn clear(&mut self) {
        self.slots.clear();
    }

    fn slot_mut(&mut self, identity: &str) -> &mut CacheSlot {
        if let Some(idx) = self.slots.iter().position(|slot| slot.identity == identity) {
            return &mut self.slots[idx];
        }
        if self.slots.len() >= self.capacity {
            self.slots.pop_front();
        }
        self.slots.push_back(CacheSlot {
            identity: identity.to_string(),
            bytes: None,
            backdrop: None,
        });
        let last = self.slots.len() - 1;
        &mut self.slots[last]
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Layout {
    size_factor: f64,
    thumb_size: u32,
    thumb_x: i64,
    thumb_y: i64,
    text_x: f64,
    max_text_width: f64,
    title_size: f64,
    artist_size: f64,
}

impl Layout {
    fn for_geometry(geometry: ScreenGeometry) -> Layout {
        let width = f64::from(geometry.width_px);
        let height = f64::from(geometry.height_px);
        let size_factor = height / BASE_HEIGHT;
        let thumb = (THUMBNAIL_SIZE * size_factor).round().max(1.0);
        let thumb_x = (LEFT_MARGIN * size_factor).round();
        let thumb_y = ((height - thumb) / 2.0).round();
        let text_x = thumb_x + thumb + TEXT_GAP * size_factor;
        Layout {
            size_factor,
            thumb_size: thumb as u32,
            thumb_x: thumb_x as i64,
            thumb_y: thumb_y as i64,
            text_x,
            max_text_width: (width - text_x - RIGHT_MARGIN * size_factor).max(0.0),
            title_size: TITLE_FONT_SIZE * size_factor,
            artist_size: ARTIST_FONT_SIZE * size_factor,
        }
    }
}

fn estimated_text_width(text: &str, font_size: f64) -> f64 {
    text.chars().count() as f64 * font_size * GLYPH_WIDTH_RATIO
}

/// Shrinks a nominal font size until the estimated line width fits, floored
/// at half the nominal size. Each line shrinks on its own.
fn fitted_font_size(text: &str, nominal: f64, max_width: f64) -> f64 {
    let estimated = estimated_text_width(text, nominal);
    if estimated <= 0.0 || estimated <= max_width {
        return nominal;
    }
    nominal * (max_width / estimated).max(MIN_TEXT_SHRINK)
}

fn text_layer_svg(track: &TrackMetadata, layout: &Layout, width: u32, height: u32) -> String {
    let center_y = f64::from(height) / 2.0;
    let title_size = fitted_font_size(&track.title, layout.title_size, layout.max_text_width);
    let artist_size = fitted_font_size(&track.artist, layout.artist_size, layout.max_text_width);
    let title_shrink = title_size / layout.title_size.max(f64::MIN_POSITIVE);
    let artist_shrink = artist_size / layout.artist_size.max(f64::MIN_POSITIVE);
    // Baseline offsets follow each line's own shrink so smaller text stays
    // visually centered.
    let title_y = center_y - TITLE_BASELINE_RISE * layout.size_factor * title_shrink;
    let artist_y = center_y + ARTIST_BASELINE_DROP * layout.size_factor * artist_shrink;
    let title = escape_markup(&track.title);
    let artist = escape_markup(&track.artist);
    let x = layout.text_x;
    format!(
        r##"<svg xmlns="http://www.w3.org/2000/svg" width="{width}" height="{height}">
  <text x="{x:.1}" y="{title_y:.1}" font-family="{TEXT_FONT_FAMILY}" font-size="{title_size:.1}" font-weight="bold" fill="#ffffff">{title}</text>
  <text x="{x:.1}" y="{artist_y:.1}" font-family="{TEXT_FONT_FAMILY}" font-size="{artist_size:.1}" fill="#e8e8e8">{artist}</text>
</svg>
"##
    )
}

fn font_database() -> Arc<usvg::fontdb::Database> {
    static FONTS: OnceLock<Arc<usvg::fontdb::Database>> = OnceLock::new();
    Arc::clone(FONTS.get_or_init(|| {
        let mut db = usvg::fontdb::Database::new();
        db.load_system_fonts();
        Arc::new(db)
    }))
}

fn render_text_layer(
    track: &TrackMetadata,
    layout: &Layout,
    width: u32,
    height: u32,
) -> Result<tiny_skia::Pixmap> {
    let svg = text_layer_svg(track, layout, width, height);
    let mut options = usvg::Options::default();
    options.fontdb = font_database();
    let tree = usvg::Tree::from_str(&svg, &options).context("parse text layer markup")?;
    let mut pixmap = tiny_skia::Pixmap::new(width, height).context("allocate text layer")?;
    resvg::render(&tree, tiny_skia::Transform::identity(), &mut pixmap.as_mut());
    Ok(pixmap)
}

fn render_backdrop(art: &DynamicImage, width: u32, height: u32) -> RgbaImage {
    let size_factor = f64::from(height) / BASE_HEIGHT;
    let over_w = width.saturating_mul(BACKDROP_SUPERSAMPLE).max(1);
    let over_h = height.saturating_mul(BACKDROP_SUPERSAMPLE).max(1);
    // Blur at the supersampled scale, then downsample; the sigma is doubled so
    // the effective radius at target scale stays past the point of legibility.
    let sigma = (BACKDROP_BLUR_SIGMA * size_factor as f32 * BACKDROP_SUPERSAMPLE as f32).max(1.0);
    let mut canvas = art
        .resize_to_fill(over_w, over_h, FilterType::Triangle)
        .fast_blur(sigma)
        .resize_exact(width, height, FilterType::Triangle)
        .to_rgba8();
    shade_backdrop(&mut canvas);
    canvas
}

// Darkens the backdrop toward black with a slight saturation lift so the
// text layer stays readable over any artwork.
fn shade_backdrop(img: &mut RgbaImage) {
    let shade = 1.0 - BACKDROP_SHADE_ALPHA;
    for pixel in img.pixels_mut() {
        let r = f64::from(pixel[0]) * BACKDROP_BRIGHTNESS;
        let g = f64::from(pixel[1]) * BACKDROP_BRIGHTNESS;
        let b = f64::from(pixel[2]) * BACKDROP_BRIGHTNESS;
        let luma = 0.2126 * r + 0.7152 * g + 0.0722 * b;
        let adjust = |c: f64| {
            ((luma + (c - luma) * BACKDROP_SATURATION) * shade)
                .round()
                .clamp(0.0, 255.0) as u8
        };
        *pixel = Rgba([adjust(r), adjust(g), adjust(b), 255]);
    }
}

fn render_thumbnail(art: &DynamicImage, size: u32) -> RgbaImage {
    let size = size.max(1);
    art.resize_to_fill(size, size, FilterType::Lanczos3)
        .unsharpen(THUMBNAIL_SHARPEN_SIGMA, THUMBNAIL_SHARPEN_THRESHOLD)
        .to_rgba8()
}

fn blend_pixel(dst: Rgba<u8>, src: Rgba<u8>) -> Rgba<u8> {
    let a = f64::from(src[3]) / 255.0;
    if a <= 0.0 {
        return dst;
    }
    let inv = 1.0 - a;
    let r = (f64::from(dst[0]) * inv + f64::from(src[0]) * a)
        .round()
        .clamp(0.0, 255.0) as u8;
    let g = (f64::from(dst[1]) * inv + f64::from(src[1]) * a)
        .round()
        .clamp(0.0, 255.0) as u8;
    let b = (f64::from(dst[2]) * inv + f64::from(src[2]) * a)
        .round()
        .clamp(0.0, 255.0) as u8;
    let out_a = (f64::from(src[3]) + f64::from(dst[3]) * inv)
        .round()
        .clamp(0.0, 255.0) as u8;
    Rgba([r, g, b, out_a])
}

fn blend_text_layer(canvas: &mut RgbaImage, text: &tiny_skia::Pixmap) {
    let width = canvas.width().min(text.width());
    let height = canvas.height().min(text.height());
    let pixels = text.pixels();
    for y in 0..height {
        for x in 0..width {
            let src = pixels[(y * text.width() + x) as usize].demultiply();
            if src.alpha() == 0 {
                continue;
            }
            let dst = *canvas.get_pixel(x, y);
            let src = Rgba([src.red(), src.green(), src.blue(), src.alpha()]);
            canvas.put_pixel(x, y, blend_pixel(dst, src));
        }
    }
}

struct ComposedWallpaper {
    png: Vec<u8>,
    backdrop: Arc<RgbaImage>,
}

/// Flattens backdrop, thumbnail, and text layer into one PNG at the screen's
/// pixel size. A backdrop rendered earlier for the same artwork and size can
/// be passed back in to skip the blur pass.
fn compose_wallpaper(
    art_bytes: &[u8],
    track: &TrackMetadata,
    geometry: ScreenGeometry,
    cached_backdrop: Option<Arc<RgbaImage>>,
) -> Result<ComposedWallpaper> {
    let (width, height) = geometry.pixel_size();
    if width == 0 || height == 0 {
        bail!("screen reports a zero-sized display");
    }
    let art = image::load_from_memory(art_bytes).context("decode artwork")?;
    let layout = Layout::for_geometry(geometry);

    let backdrop = match cached_backdrop {
        Some(cached) if cached.width() == width && cached.height() == height => cached,
        _ => Arc::new(render_backdrop(&art, width, height)),
    };

    let mut canvas = (*backdrop).clone();
    let thumb = render_thumbnail(&art, layout.thumb_size);
    image::imageops::overlay(&mut canvas, &thumb, layout.thumb_x, layout.thumb_y);
    let text = render_text_layer(track, &layout, width, height)?;
    blend_text_layer(&mut canvas, &text);

    let mut png = Vec::new();
    canvas
        .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
        .context("encode wallpaper")?;
    Ok(ComposedWallpaper { png, backdrop })
}

/// The operating-system side of the daemon: player sampling, desktop picture
/// access, display geometry, and artwork download. Implementations block; the
/// async loop calls them through the blocking pool.
trait Desk: Send + Sync + 'static {
    fn sample_now_playing(&self) -> Result<PlaybackSample>;
    fn screen_geometry(&self) -> Result<ScreenGeometry>;
    fn current_wallpaper(&self) -> Result<PathBuf>;
    fn set_wallpaper(&self, path: &Path) -> Result<()>;
    fn download_artwork(&self, url: &str) -> Result<Vec<u8>>;
}

type SharedDesk = Arc<dyn Desk>;

async fn desk_call<T, F>(desk: &SharedDesk, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&dyn Desk) -> Result<T> + Send + 'static,
{
    let desk = Arc::clone(desk);
    tokio::task::spawn_blocking(move || f(desk.as_ref()))
        .await
        .context("collaborator call interrupted")?
}

struct MacDesk {
    player: String,
    scale_factor: f32,
    http: OnceLock<reqwest::blocking::Client>,
}

impl MacDesk {
    fn new(config: &Config) -> MacDesk {
        MacDesk {
            player: config.player.clone(),
            scale_factor: config.scale_factor,
            http: OnceLock::new(),
        }
    }

    fn http_client(&self) -> Result<&reqwest::blocking::Client> {
        if let Some(client) = self.http.get() {
            return Ok(client);
        }
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .user_agent(HTTP_USER_AGENT)
            .build()
            .context("build http client")?;
        Ok(self.http.get_or_init(|| client))
    }
}

impl Desk for MacDesk {
    fn sample_now_playing(&self) -> Result<PlaybackSample> {
        let raw = run_osascript(&sample_script(&self.player), 2, 80)?;
        parse_sample_line(&raw)
    }

    fn screen_geometry(&self) -> Result<ScreenGeometry> {
        let raw = run_osascript(DESKTOP_BOUNDS_SCRIPT, 3, 120)?;
        let line = first_line(&raw);
        if let Some(detail) = line.strip_prefix("err:") {
            bail!("could not read display bounds: {detail}");
        }
        let (width, height) = parse_desktop_bounds(line)?;
        Ok(ScreenGeometry::from_logical(width, height, self.scale_factor))
    }

    fn current_wallpaper(&self) -> Result<PathBuf> {
        let raw = run_osascript(CURRENT_WALLPAPER_SCRIPT, 3, 120)?;
        let line = first_line(&raw);
        if let Some(detail) = line.strip_prefix("err:") {
            bail!("could not read current wallpaper: {detail}");
        }
        if line.is_empty() {
            bail!("desktop returned an empty wallpaper path");
        }
        Ok(PathBuf::from(line))
    }

    fn set_wallpaper(&self, path: &Path) -> Result<()> {
        let raw = run_osascript(&set_wallpaper_script(path), 3, 150)?;
        let line = first_line(&raw);
        if let Some(detail) = line.strip_prefix("err:") {
            bail!("desktop refused the wallpaper change: {detail}");
        }
        Ok(())
    }

    fn download_artwork(&self, url: &str) -> Result<Vec<u8>> {
        let client = self.http_client()?;
        let response = client
            .get(url)
            .send()
            .and_then(reqwest::blocking::Response::error_for_status)
            .with_context(|| format!("download artwork: {url}"))?;
        let bytes = response.bytes().context("read artwork body")?;
        Ok(bytes.to_vec())
    }
}

fn sample_script(player: &str) -> String {
    let escaped = escape_applescript(player);
    format!(
        r#"on cleanText(v)
  try
    set t to v as text
  on error
    set t to ""
  end try
  set AppleScript's text item delimiters to {{return, linefeed, tab}}
  set parts to text items of t
  set AppleScript's text item delimiters to " "
  set clean to parts as text
  set AppleScript's text item delimiters to ""
  return clean
end cleanText

on run
  tell application "System Events"
    if not (exists process "{escaped}") then return "state:closed"
  end tell
  try
    tell application "{escaped}"
      if player state is playing then
        set trackArtist to artist of current track
        set trackName to name of current track
        set artUrl to artwork url of current track
        return "state:playing" & tab & my cleanText(trackArtist) & tab & my cleanText(trackName) & tab & my cleanText(artUrl)
      else
        return "state:idle"
      end if
    end tell
  on error errMsg number errNum
    return "err:" & errNum & ":" & errMsg
  end try
end run"#
    )
}

const DESKTOP_BOUNDS_SCRIPT: &str = r#"try
  tell application "Finder"
    set b to bounds of window of desktop
    return ((item 1 of b) as text) & "," & ((item 2 of b) as text) & "," & ((item 3 of b) as text) & "," & ((item 4 of b) as text)
  end tell
on error errMsg number errNum
  return "err:" & errNum & ":" & errMsg
end try"#;

const CURRENT_WALLPAPER_SCRIPT: &str = r#"try
  tell application "System Events"
    return (picture of first desktop) as text
  end tell
on error errMsg number errNum
  return "err:" & errNum & ":" & errMsg
end try"#;

fn set_wallpaper_script(path: &Path) -> String {
    let escaped = escape_applescript(&path.display().to_string());
    format!(
        r#"try
  tell application "System Events"
    set picture of every desktop to "{escaped}"
  end tell
  return "ok"
on error errMsg number errNum
  return "err:" & errNum & ":" & errMsg
end try"#
    )
}

fn escape_applescript(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' | '\r' => out.push(' '),
            _ => out.push(ch),
        }
    }
    out
}

fn first_line(raw: &str) -> &str {
    raw.lines().next().unwrap_or("").trim()
}

fn parse_sample_line(raw: &str) -> Result<PlaybackSample> {
    let line = first_line(raw);
    if line == "state:closed" {
        return Ok(PlaybackSample::PlayerNotRunning);
    }
    if line == "state:idle" {
        return Ok(PlaybackSample::NotPlaying);
    }
    if let Some(detail) = line.strip_prefix("err:") {
        bail!("player query failed: {detail}");
    }
    let Some(rest) = line.strip_prefix("state:playing\t") else {
        bail!("unexpected player response: {line}");
    };
    let mut parts = rest.splitn(3, '\t');
    let artist = parts.next().unwrap_or("").trim();
    let title = parts.next().unwrap_or("").trim();
    let artwork = parts.next().unwrap_or("").trim();
    if title.is_empty() || artwork.is_empty() {
        bail!("incomplete track payload: {line}");
    }
    let (title, artist) = split_featuring(title, artist);
    Ok(PlaybackSample::Playing(TrackMetadata {
        artist,
        title,
        artwork_url: artwork.to_string(),
    }))
}

fn parse_desktop_bounds(line: &str) -> Result<(f64, f64)> {
    let parts: Vec<f64> = line
        .split(',')
        .map(|part| part.trim().parse::<f64>())
        .collect::<Result<_, _>>()
        .with_context(|| format!("unexpected display bounds: {line}"))?;
    if parts.len() != 4 {
        bail!("unexpected display bounds: {line}");
    }
    let width = parts[2] - parts[0];
    let height = parts[3] - parts[1];
    if width <= 0.0 || height <= 0.0 {
        bail!("display bounds are degenerate: {line}");
    }
    Ok((width, height))
}

fn run_osascript(script: &str, attempts: u32, delay_ms: u64) -> Result<String> {
    if !cfg!(target_os = "macos") {
        bail!("osascript requires macOS");
    }

    let max_attempts = attempts.max(1);
    let mut last_error = String::from("osascript returned empty output");

    for attempt in 1..=max_attempts {
        let mut cmd = Command::new("osascript");
        cmd.arg("-e").arg(script);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        match cmd.spawn() {
            Ok(mut child) => match child.wait_timeout(Duration::from_millis(OSASCRIPT_TIMEOUT_MS)) {
                Ok(Some(_)) => match child.wait_with_output() {
                    Ok(output) => {
                        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
                        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                        if output.status.success() && !stdout.is_empty() {
                            return Ok(stdout);
                        }
                        if output.status.success() {
                            last_error =
                                String::from("osascript succeeded but returned empty output");
                        } else {
                            let code = output.status.code().unwrap_or(1);
                            last_error = if stderr.is_empty() {
                                format!("osascript failed with status {code}")
                            } else {
                                stderr
                            };
                        }
                    }
                    Err(err) => last_error = format!("osascript output unavailable: {err}"),
                },
                Ok(None) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    last_error = format!(
                        "osascript timed out after {OSASCRIPT_TIMEOUT_MS}ms (attempt {attempt}/{max_attempts})"
                    );
                }
                Err(err) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    last_error = format!("osascript wait failed: {err}");
                }
            },
            Err(err) => last_error = format!("osascript spawn failed: {err}"),
        }

        if attempt < max_attempts {
            let backoff = delay_ms.saturating_mul(u64::from(attempt));
            thread::sleep(Duration::from_millis(backoff.max(10)));
        }
    }

    bail!("{last_error}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CycleOutcome {
    /// Same track (or still idle); nothing to do.
    NoChange,
    /// A new wallpaper was installed.
    Updated,
    /// Playback stopped; the original wallpaper was put back.
    Restored,
    /// Transient failure; the next tick will try again.
    Skipped,
    /// Another cycle was already in flight.
    Dropped,
    ShuttingDown,
}

struct ReconcilerState {
    last_track: Option<TrackMetadata>,
    last_art: Option<(String, Arc<Vec<u8>>)>,
    current_output: Option<PathBuf>,
    original_wallpaper: PathBuf,
    cache: ArtCache,
    finalized: bool,
}

/// Drives the wallpaper toward the observed playback state, one poll at a
/// time. State is only ever touched from the poll sequence and from
/// `finalize`; the lock is never held across a collaborator call so shutdown
/// cannot be wedged behind a hung script.
struct Reconciler {
    desk: SharedDesk,
    geometry: ScreenGeometry,
    work_dir: PathBuf,
    poll_period: Duration,
    updating: AtomicBool,
    shutdown: CancellationToken,
    state: Mutex<ReconcilerState>,
}

impl Reconciler {
    fn new(
        desk: SharedDesk,
        geometry: ScreenGeometry,
        original_wallpaper: PathBuf,
        work_dir: PathBuf,
        poll_period: Duration,
    ) -> Reconciler {
        Reconciler {
            desk,
            geometry,
            work_dir,
            poll_period,
            updating: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            state: Mutex::new(ReconcilerState {
                last_track: None,
                last_art: None,
                current_output: None,
                original_wallpaper,
                cache: ArtCache::new(CACHE_CAPACITY),
                finalized: false,
            }),
        }
    }

    /// Stops scheduling immediately. Safe to call any number of times, from
    /// any task.
    fn request_shutdown(&self) {
        self.shutdown.cancel();
    }

    async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.poll_period,
            self.poll_period,
        );
        // A cycle can outlast several periods; skip the backlog instead of
        // replaying it.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let outcome = self.run_cycle_once().await;
                    debug!("poll tick: {outcome:?}");
                }
            }
        }
        debug!("poll loop stopped");
    }

    /// One poll-and-reconcile pass. Overlapping calls are dropped, not
    /// queued.
    async fn run_cycle_once(&self) -> CycleOutcome {
        if self.shutdown.is_cancelled() {
            return CycleOutcome::ShuttingDown;
        }
        if self.updating.swap(true, Ordering::SeqCst) {
            debug!("previous update cycle still running; dropping this tick");
            return CycleOutcome::Dropped;
        }
        let outcome = self.cycle_inner().await;
        self.updating.store(false, Ordering::SeqCst);
        outcome
    }

    async fn cycle_inner(&self) -> CycleOutcome {
        let sample = match desk_call(&self.desk, |d| d.sample_now_playing()).await {
            Ok(sample) => sample,
            Err(err) => {
                // A shutdown signal can interrupt the scripting call; stay
                // quiet in that case.
                if !self.shutdown.is_cancelled() {
                    warn!("player poll failed: {err:#}");
                }
                return CycleOutcome::Skipped;
            }
        };
        if self.shutdown.is_cancelled() {
            return CycleOutcome::ShuttingDown;
        }
        match sample {
            PlaybackSample::NotPlaying | PlaybackSample::PlayerNotRunning => {
                self.settle_idle().await
            }
            PlaybackSample::Playing(track) => self.install_track(track).await,
        }
    }

    async fn settle_idle(&self) -> CycleOutcome {
        let (prev, original) = {
            let mut state = self.state.lock().await;
            if state.last_track.is_none() {
                return CycleOutcome::NoChange;
            }
            (state.last_track.take(), state.original_wallpaper.clone())
        };
        info!("playback stopped; restoring original wallpaper");
        let path = original.clone();
        match desk_call(&self.desk, move |d| d.set_wallpaper(&path)).await {
            Ok(()) => {
                let mut state = self.state.lock().await;
                if let Some(stale) = state.current_output.take() {
                    remove_output(&stale);
                }
                CycleOutcome::Restored
            }
            Err(err) => {
                // The desktop may still point at the output file, so it
                // stays on disk and the next idle tick retries the restore.
                if !self.shutdown.is_cancelled() {
                    warn!("could not restore original wallpaper: {err:#}");
                }
                self.rollback(prev).await;
                CycleOutcome::Skipped
            }
        }
    }

    async fn install_track(&self, track: TrackMetadata) -> CycleOutcome {
        let (prev_track, held) = {
            let mut state = self.state.lock().await;
            if state.last_track.as_ref() == Some(&track) {
                return CycleOutcome::NoChange;
            }
            // Advance the key before any slow work so a tick that lands
            // mid-cycle sees this track as current and no-ops.
            let prev = state.last_track.replace(track.clone());
            let held = state
                .last_art
                .as_ref()
                .filter(|entry| entry.0 == track.artwork_url)
                .map(|(_, bytes)| Arc::clone(bytes))
                .or_else(|| state.cache.bytes(&track.artwork_url));
            (prev, held)
        };
        info!("now playing: {} - {}", track.artist, track.title);

        let bytes = match held {
            Some(bytes) => bytes,
            None => {
                let url = track.artwork_url.clone();
                match desk_call(&self.desk, move |d| d.download_artwork(&url)).await {
                    Ok(fetched) => {
                        let fetched = Arc::new(fetched);
                        let mut state = self.state.lock().await;
                        state.cache.put_bytes(&track.artwork_url, Arc::clone(&fetched));
                        debug!(
                            "cached artwork {} ({} entries)",
                            track.artwork_url,
                            state.cache.len()
                        );
                        fetched
                    }
                    Err(err) => {
                        if !self.shutdown.is_cancelled() {
                            warn!("artwork download failed; retrying next tick: {err:#}");
                        }
                        self.rollback(prev_track).await;
                        return CycleOutcome::Skipped;
                    }
                }
            }
        };
        {
            let mut state = self.state.lock().await;
            state.last_art = Some((track.artwork_url.clone(), Arc::clone(&bytes)));
        }
        if self.shutdown.is_cancelled() {
            return CycleOutcome::ShuttingDown;
        }

        let dims = self.geometry.pixel_size();
        let cached_backdrop = {
            let state = self.state.lock().await;
            state.cache.backdrop(&track.artwork_url, dims)
        };
        let geometry = self.geometry;
        let render_track = track.clone();
        let render_bytes = Arc::clone(&bytes);
        let rendered = match tokio::task::spawn_blocking(move || {
            compose_wallpaper(&render_bytes, &render_track, geometry, cached_backdrop)
        })
        .await
        {
            Ok(rendered) => rendered,
            Err(err) => {
                warn!("compose task failed: {err}");
                self.rollback(prev_track).await;
                return CycleOutcome::Skipped;
            }
        };
        let composed = match rendered {
            Ok(composed) => composed,
            Err(err) => {
                // Bad bytes stay bad; skip this track instead of hammering
                // the decoder every second.
                warn!("artwork unusable; keeping current wallpaper: {err:#}");
                return CycleOutcome::Skipped;
            }
        };
        {
            let mut state = self.state.lock().await;
            state
                .cache
                .put_backdrop(&track.artwork_url, dims, Arc::clone(&composed.backdrop));
        }

        let out_path = self.work_dir.join(unique_output_name());
        if let Err(err) = tokio::fs::write(&out_path, &composed.png).await {
            warn!("could not write {}: {err}", out_path.display());
            remove_output(&out_path);
            self.rollback(prev_track).await;
            return CycleOutcome::Skipped;
        }
        if self.shutdown.is_cancelled() {
            remove_output(&out_path);
            return CycleOutcome::ShuttingDown;
        }

        let set_path = out_path.clone();
        match desk_call(&self.desk, move |d| d.set_wallpaper(&set_path)).await {
            Ok(()) => {
                let previous = {
                    let mut state = self.state.lock().await;
                    state.current_output.replace(out_path.clone())
                };
                // The desktop now points at the new file; only then is the
                // old one safe to delete.
                if let Some(previous) = previous {
                    if previous != out_path {
                        remove_output(&previous);
                    }
                }
                info!("wallpaper updated: {}", out_path.display());
                CycleOutcome::Updated
            }
            Err(err) => {
                if !self.shutdown.is_cancelled() {
                    error!("failed to set wallpaper; retrying next tick: {err:#}");
                }
                remove_output(&out_path);
                self.rollback(prev_track).await;
                CycleOutcome::Skipped
            }
        }
    }

    async fn rollback(&self, prev: Option<TrackMetadata>) {
        let mut state = self.state.lock().await;
        state.last_track = prev;
    }

    /// Restores the original wallpaper, removes the last output file, and
    /// drops the cache. Idempotent; later calls are no-ops.
    async fn finalize(&self) {
        self.shutdown.cancel();
        let (original, output) = {
            let mut state = self.state.lock().await;
            if state.finalized {
                return;
            }
            state.finalized = true;
            state.last_track = None;
            state.last_art = None;
            state.cache.clear();
            (state.original_wallpaper.clone(), state.current_output.take())
        };
        let path = original.clone();
        match desk_call(&self.desk, move |d| d.set_wallpaper(&path)).await {
            Ok(()) => info!("original wallpaper restored: {}", original.display()),
            Err(err) => warn!("could not restore original wallpaper: {err:#}"),
        }
        if let Some(output) = output {
            remove_output(&output);
        }
    }
}

async fn run_daemon(config: Config) -> Result<()> {
    let desk: SharedDesk = Arc::new(MacDesk::new(&config));

    // Both of these are required before the first cycle; failing here aborts
    // startup instead of looping blind.
    let original = desk_call(&desk, |d| d.current_wallpaper())
        .await
        .context("capture current wallpaper")?;
    let geometry = desk_call(&desk, |d| d.screen_geometry())
        .await
        .context("read screen geometry")?;

    let work_dir = config.work_dir_path();
    fs::create_dir_all(&work_dir)
        .with_context(|| format!("create working directory: {}", work_dir.display()))?;
    sweep_stale_outputs(&work_dir);

    info!(
        "watching {} every {}ms (screen {}x{})",
        config.player, config.poll_interval_ms, geometry.width_px, geometry.height_px
    );
    info!("original wallpaper: {}", original.display());

    let reconciler = Arc::new(Reconciler::new(
        desk,
        geometry,
        original,
        work_dir,
        Duration::from_millis(config.poll_interval_ms),
    ));

    let mut sigint = signal(SignalKind::interrupt()).context("install SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("install SIGTERM handler")?;

    // First poll runs before the ticker so the wallpaper reflects whatever is
    // already playing.
    reconciler.run_cycle_once().await;
    let loop_task = tokio::spawn(Arc::clone(&reconciler).run());

    tokio::select! {
        _ = sigint.recv() => info!("received SIGINT; shutting down"),
        _ = sigterm.recv() => info!("received SIGTERM; shutting down"),
    }
    reconciler.request_shutdown();

    let grace = Duration::from_millis(config.shutdown_grace_ms);
    match tokio::time::timeout(grace, loop_task).await {
        Ok(Ok(())) => debug!("poll loop drained"),
        Ok(Err(err)) => warn!("poll loop task failed: {err}"),
        Err(_) => warn!(
            "update cycle still running after {}ms; cleaning up anyway",
            config.shutdown_grace_ms
        ),
    }
    reconciler.finalize().await;
    Ok(())
}

static OUTPUT_SEQ: AtomicU64 = AtomicU64::new(0);

fn unique_output_name() -> String {
    let seq = OUTPUT_SEQ.fetch_add(1, Ordering::Relaxed);
    let salt: u32 = rand::thread_rng().gen_range(1000..9999);
    format!(
        "{OUTPUT_PREFIX}{}-{}-{seq}-{salt}.png",
        timestamp_compact(),
        std::process::id()
    )
}

fn timestamp_compact() -> String {
    Utc::now().format("%Y%m%d-%H%M%S").to_string()
}

fn sweep_stale_outputs(work_dir: &Path) {
    let entries = match fs::read_dir(work_dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.starts_with(OUTPUT_PREFIX) && name.ends_with(".png") {
            debug!("removing stale output {}", entry.path().display());
            let _ = fs::remove_file(entry.path());
        }
    }
}

fn remove_output(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!("removed output {}", path.display()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!("could not remove {}: {err}", path.display()),
    }
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory: {}", parent.display())
            })?;
        }
    }
    Ok(())
}

fn agent_plist_path() -> PathBuf {
    home_dir()
        .join("Library")
        .join("LaunchAgents")
        .join(format!("{AGENT_LABEL}.plist"))
}

fn agent_plist(exe: &Path, log_dir: &Path) -> String {
    let exe = escape_markup(&exe.display().to_string());
    let stdout_log = escape_markup(&log_dir.join("agent.log").display().to_string());
    let stderr_log = escape_markup(&log_dir.join("agent.err.log").display().to_string());
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>Label</key>
    <string>{AGENT_LABEL}</string>
    <key>ProgramArguments</key>
    <array>
        <string>{exe}</string>
        <string>run</string>
    </array>
    <key>RunAtLoad</key>
    <true/>
    <key>KeepAlive</key>
    <true/>
    <key>StandardOutPath</key>
    <string>{stdout_log}</string>
    <key>StandardErrorPath</key>
    <string>{stderr_log}</string>
</dict>
</plist>
"#
    )
}

fn agent_install() -> Result<()> {
    let exe = env::current_exe().context("resolve current executable")?;
    let log_dir = default_work_dir();
    fs::create_dir_all(&log_dir)
        .with_context(|| format!("create log directory: {}", log_dir.display()))?;

    let plist_path = agent_plist_path();
    ensure_parent_dir(&plist_path)?;
    fs::write(&plist_path, agent_plist(&exe, &log_dir))
        .with_context(|| format!("write {}", plist_path.display()))?;

    // Reinstalls pass through unload first so launchctl does not refuse the
    // load; a missing agent makes this a no-op.
    let _ = Command::new("launchctl")
        .arg("unload")
        .arg(&plist_path)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    let status = Command::new("launchctl")
        .arg("load")
        .arg("-w")
        .arg(&plist_path)
        .status()
        .context("run launchctl load")?;
    if !status.success() {
        bail!("launchctl load failed with status {}", status.code().unwrap_or(1));
    }
    println!("installed {}", plist_path.display());
    Ok(())
}

fn agent_uninstall() -> Result<()> {
    let plist_path = agent_plist_path();
    if !plist_path.exists() {
        println!("not installed");
        return Ok(());
    }
    let _ = Command::new("launchctl")
        .arg("unload")
        .arg(&plist_path)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    fs::remove_file(&plist_path).with_context(|| format!("remove {}", plist_path.display()))?;
    println!("uninstalled {}", plist_path.display());
    Ok(())
}
