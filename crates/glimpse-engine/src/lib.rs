use std::env;
use std::fmt;
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use glimpse_contracts::catalog::{self, ModelCatalog};
use glimpse_contracts::chat::{
    extract_message_content, VisionChatRequest, CHAT_COMPLETIONS_PATH, MODELS_PATH,
};
use glimpse_contracts::events::{EventFields, RunLog};
use image::{DynamicImage, ImageFormat, RgbImage};
use regex::Regex;
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Value};

// Local inference can take many minutes on large vision models.
const REQUEST_TIMEOUT_SECS: u64 = 1200;
const PROBE_TIMEOUT_SECS: u64 = 5;
const LIST_TIMEOUT_SECS: u64 = 10;
const LOAD_TIMEOUT_SECS: u64 = 180;
const UNLOAD_TIMEOUT_SECS: u64 = 15;
const PS_TIMEOUT_SECS: u64 = 5;

/// Extensions the directory captioner picks up (lowercased comparison).
pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp"];

const VRAM_FAILURE_MARKERS: &[&str] = &["unable to allocate", "cuda", "out of memory", "vram"];

pub fn default_server_url() -> String {
    non_empty_env("GLIMPSE_SERVER_URL").unwrap_or_else(|| "http://localhost:1234".to_string())
}

pub fn lms_binary() -> String {
    non_empty_env("GLIMPSE_LMS_BIN").unwrap_or_else(|| "lms".to_string())
}

/// Re-encodes an in-memory image to PNG and base64s the bytes. Failures
/// are logged and reported as `None`; the caller treats that as terminal
/// for this image.
pub fn encode_rgb_image(image: &RgbImage) -> Option<String> {
    match png_base64(&DynamicImage::ImageRgb8(image.clone())) {
        Ok(encoded) => Some(encoded),
        Err(err) => {
            eprintln!("[glimpse] image encode failed: {err:#}");
            None
        }
    }
}

/// Reads an image file in any supported format and re-encodes it to PNG
/// before base64, so the wire format is always the same.
pub fn encode_image_from_path(path: &Path) -> Option<String> {
    let result = image::open(path)
        .with_context(|| format!("failed decoding {}", path.display()))
        .and_then(|decoded| png_base64(&decoded));
    match result {
        Ok(encoded) => Some(encoded),
        Err(err) => {
            eprintln!("[glimpse] Error encoding {}: {err:#}", path.display());
            None
        }
    }
}

fn png_base64(image: &DynamicImage) -> Result<String> {
    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .context("failed encoding PNG")?;
    Ok(BASE64.encode(&bytes))
}

#[derive(Debug, Clone)]
pub struct DescribeOptions {
    pub model: String,
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub temperature: f64,
    pub max_tokens: u32,
}

/// Classified failure of one vision request. Every variant renders to a
/// user-facing message; callers that must always fill their output slot
/// use the rendered text in place of the caption.
#[derive(Debug)]
pub enum VisionError {
    Connect { server_url: String },
    Http { status: u16, body: String },
    Payload(String),
    Image(String),
    Other(String),
}

impl fmt::Display for VisionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VisionError::Connect { server_url } => write!(
                f,
                "Connection Error: LM Studio server at {server_url} not reachable. \
                 Is LM Studio running and the server started?"
            ),
            VisionError::Http { status, body } => {
                write!(f, "HTTP Error {status}: {}", truncate_text(body, 512))?;
                if *status == 404 {
                    write!(f, "\nHINT: Is the vision model loaded in LM Studio?")?;
                }
                if body.contains("does not support images") {
                    write!(
                        f,
                        "\nHINT: The loaded model does not support images. Load a vision \
                         model (e.g. llava-v1.5, qwen2-vl, pixtral)."
                    )?;
                }
                Ok(())
            }
            VisionError::Payload(detail) => write!(f, "Unexpected response payload: {detail}"),
            VisionError::Image(path) => write!(f, "Image could not be encoded: {path}"),
            VisionError::Other(detail) => write!(f, "Request failed: {detail}"),
        }
    }
}

impl std::error::Error for VisionError {}

/// Blocking client for an OpenAI-compatible vision server. One request
/// per call, no retries; a long timeout stands in for progress feedback.
pub struct VisionClient {
    http: HttpClient,
    server_url: String,
}

impl VisionClient {
    pub fn new(server_url: &str) -> Result<Self> {
        let http = HttpClient::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .context("failed building HTTP client")?;
        Ok(Self {
            http,
            server_url: server_url.trim().trim_end_matches('/').to_string(),
        })
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// Sends one image+prompt request and returns the generated text.
    pub fn describe(
        &self,
        options: &DescribeOptions,
        image_base64: &str,
    ) -> Result<String, VisionError> {
        let payload = VisionChatRequest::new(
            &options.model,
            &options.prompt,
            options.system_prompt.as_deref(),
            image_base64,
            options.temperature,
            options.max_tokens,
        );
        let url = format!("{}{}", self.server_url, CHAT_COMPLETIONS_PATH);
        let response = self
            .http
            .post(&url)
            .json(&payload)
            .send()
            .map_err(|err| self.classify_send_error(err))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(VisionError::Http {
                status: status.as_u16(),
                body,
            });
        }
        let body: Value = response
            .json()
            .map_err(|err| VisionError::Payload(err.to_string()))?;
        match extract_message_content(&body) {
            Some(text) => Ok(text.to_string()),
            None => Err(VisionError::Payload(
                "missing choices[0].message.content".to_string(),
            )),
        }
    }

    pub fn describe_file(
        &self,
        options: &DescribeOptions,
        path: &Path,
    ) -> Result<String, VisionError> {
        let image_base64 = encode_image_from_path(path)
            .ok_or_else(|| VisionError::Image(path.display().to_string()))?;
        self.describe(options, &image_base64)
    }

    /// Never fails: a classified failure is rendered into the output slot
    /// so a pipeline built on this call keeps running.
    pub fn describe_file_or_message(&self, options: &DescribeOptions, path: &Path) -> String {
        match self.describe_file(options, path) {
            Ok(text) => text,
            Err(err) => err.to_string(),
        }
    }

    /// Liveness probe: GET /v1/models with a short timeout.
    pub fn server_ready(&self) -> bool {
        let url = format!("{}{}", self.server_url, MODELS_PATH);
        self.http
            .get(&url)
            .timeout(Duration::from_secs(PROBE_TIMEOUT_SECS))
            .send()
            .map(|response| response.status().is_success())
            .unwrap_or(false)
    }

    fn classify_send_error(&self, err: reqwest::Error) -> VisionError {
        if err.is_connect() {
            VisionError::Connect {
                server_url: self.server_url.clone(),
            }
        } else if err.is_timeout() {
            VisionError::Other(format!("request timed out after {REQUEST_TIMEOUT_SECS}s"))
        } else {
            VisionError::Other(err.to_string())
        }
    }
}

/// Snapshot of the installed models, rebuilt on every call by running the
/// external listing command. Any failure falls back to the hard-coded
/// default catalog.
pub fn list_models() -> ModelCatalog {
    match try_list_models() {
        Ok(catalog) if !catalog.is_empty() => catalog,
        Ok(_) => ModelCatalog::default_models(),
        Err(err) => {
            eprintln!("[glimpse] Error listing models: {err}; using default model list");
            ModelCatalog::default_models()
        }
    }
}

fn try_list_models() -> Result<ModelCatalog> {
    let mut command = Command::new(lms_binary());
    command.args(["ls", "--detailed"]);
    let output = run_with_timeout(command, Duration::from_secs(LIST_TIMEOUT_SECS))
        .map_err(|err| anyhow::anyhow!("lms ls failed: {err}"))?;
    if !output.success {
        bail!("lms ls exited with status {:?}", output.code);
    }
    Ok(ModelCatalog::from_entries(catalog::parse_model_listing(
        &output.stdout,
    )))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuMode {
    Auto,
    GpuOnly,
    Hybrid,
    CpuOnly,
}

impl GpuMode {
    /// `auto` lets the model size pick: hybrid offload for large models,
    /// everything on the GPU otherwise.
    pub fn flag(self, large_model: bool) -> &'static str {
        match self {
            GpuMode::GpuOnly => "--gpu=max",
            GpuMode::Hybrid => "--gpu=1",
            GpuMode::CpuOnly => "--gpu=0",
            GpuMode::Auto => {
                if large_model {
                    "--gpu=1"
                } else {
                    "--gpu=max"
                }
            }
        }
    }
}

/// Models in these size classes routinely overflow a 24 GB card when
/// loaded GPU-only.
pub fn is_large_model(name: &str) -> bool {
    let lower = name.to_lowercase();
    ["27b", "30b", "34b", "70b"]
        .iter()
        .any(|marker| lower.contains(marker))
}

#[derive(Debug, Clone)]
pub struct LoadOptions {
    pub context_length: u32,
    pub gpu_mode: GpuMode,
    /// Flat wait after a successful load, for out-of-process init.
    pub wait_secs: u64,
    /// Flat wait after unloading, for VRAM cleanup.
    pub unload_wait_secs: u64,
    pub skip_unload: bool,
    /// Upper bound on the one-second-interval `lms ps` verification poll.
    pub verify_wait_secs: u64,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            context_length: 4096,
            gpu_mode: GpuMode::Auto,
            wait_secs: 10,
            unload_wait_secs: 5,
            skip_unload: false,
            verify_wait_secs: 20,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoadOutcome {
    /// Model name for API request bodies (annotation stripped, last path
    /// segment).
    pub api_name: String,
    pub status: String,
    pub loaded: bool,
    pub verified: bool,
    /// The load output mentioned a VRAM allocation failure; the caller
    /// should surface remediation hints.
    pub vram_failure: bool,
}

/// Adapter over the external `lms` CLI. Every failure becomes a status
/// string, never a propagated fault; the pipeline keeps running.
pub struct ModelManager {
    binary: String,
    catalog: ModelCatalog,
}

impl ModelManager {
    pub fn new(catalog: ModelCatalog) -> Self {
        Self {
            binary: lms_binary(),
            catalog,
        }
    }

    pub fn catalog(&self) -> &ModelCatalog {
        &self.catalog
    }

    /// Raw path for a display label; unknown labels are treated as raw
    /// identifiers already (annotation stripped).
    pub fn resolve_path(&self, label: &str) -> String {
        self.catalog
            .identifier(label)
            .map(str::to_string)
            .unwrap_or_else(|| catalog::strip_vision_suffix(label).to_string())
    }

    /// Resolves a whitespace-separated search string to the first catalog
    /// identifier whose lowercased form matches the terms in order.
    pub fn resolve_search(&self, search: &str) -> Option<String> {
        let lowered = search.trim().to_lowercase();
        let pattern = lowered
            .split_whitespace()
            .map(regex::escape)
            .collect::<Vec<String>>()
            .join(".*");
        let matcher = Regex::new(&pattern).ok()?;
        self.catalog
            .iter()
            .map(|(_, identifier)| identifier)
            .find(|identifier| matcher.is_match(&identifier.to_lowercase()))
            .map(str::to_string)
    }

    pub fn load(&self, label: &str, options: &LoadOptions) -> LoadOutcome {
        let api_name = catalog::api_model_name(label).to_string();
        let path = self.resolve_path(label);
        let large = is_large_model(label);

        if !options.skip_unload {
            self.unload_all(options.unload_wait_secs);
        }

        let mut command = Command::new(&self.binary);
        command
            .arg("load")
            .arg(&path)
            .arg("-y")
            .arg(format!("--context-length={}", options.context_length))
            .arg(options.gpu_mode.flag(large));

        let output = match run_with_timeout(command, Duration::from_secs(LOAD_TIMEOUT_SECS)) {
            Ok(output) => output,
            Err(CommandError::Timeout(_)) => {
                return LoadOutcome {
                    api_name,
                    status: "Timeout".to_string(),
                    loaded: false,
                    verified: false,
                    vram_failure: false,
                }
            }
            Err(err) => {
                return LoadOutcome {
                    api_name,
                    status: format!("Error: {err}"),
                    loaded: false,
                    verified: false,
                    vram_failure: false,
                }
            }
        };

        let combined = format!("{}\n{}", output.stdout, output.stderr).to_lowercase();
        let vram_failure = VRAM_FAILURE_MARKERS
            .iter()
            .any(|marker| combined.contains(marker));

        if !output.success {
            return LoadOutcome {
                api_name,
                status: "Load failed".to_string(),
                loaded: false,
                verified: false,
                vram_failure,
            };
        }

        if options.wait_secs > 0 {
            thread::sleep(Duration::from_secs(options.wait_secs));
        }
        let verified = self.wait_for_ready(label, options.verify_wait_secs);
        LoadOutcome {
            api_name,
            status: if verified {
                "Loaded and ready".to_string()
            } else {
                "Loaded (not verified)".to_string()
            },
            loaded: true,
            verified,
            vram_failure,
        }
    }

    /// Unloads every loaded model. "Nothing to unload" counts as success
    /// without the cleanup wait.
    pub fn unload_all(&self, unload_wait_secs: u64) -> bool {
        let mut command = Command::new(&self.binary);
        command.args(["unload", "--all", "-y"]);
        match run_with_timeout(command, Duration::from_secs(UNLOAD_TIMEOUT_SECS)) {
            Ok(output) => {
                let combined = format!("{}\n{}", output.stdout, output.stderr).to_lowercase();
                if combined.contains("no models to unload") || combined.contains("no models loaded")
                {
                    true
                } else if output.success || combined.contains("unloaded") {
                    if unload_wait_secs > 0 {
                        thread::sleep(Duration::from_secs(unload_wait_secs));
                    }
                    true
                } else {
                    thread::sleep(Duration::from_secs(unload_wait_secs.min(3)));
                    false
                }
            }
            Err(CommandError::Timeout(_)) => {
                thread::sleep(Duration::from_secs(unload_wait_secs.min(3)));
                false
            }
            Err(err) => {
                eprintln!("[glimpse] unload failed: {err}");
                false
            }
        }
    }

    /// Checks `lms ps` output for the model by clean name, raw path, or
    /// any name fragment longer than four characters.
    pub fn model_loaded(&self, label: &str) -> bool {
        let mut command = Command::new(&self.binary);
        command.arg("ps");
        let Ok(output) = run_with_timeout(command, Duration::from_secs(PS_TIMEOUT_SECS)) else {
            return false;
        };
        if !output.success {
            return false;
        }
        let clean = catalog::strip_vision_suffix(label);
        let path = self.resolve_path(label);
        if output.stdout.contains(clean) || output.stdout.contains(&path) {
            return true;
        }
        clean
            .replace('/', " ")
            .split_whitespace()
            .any(|part| part.len() > 4 && output.stdout.contains(part))
    }

    /// Bounded poll: checks once per second until the model shows up in
    /// the status listing or the bound runs out.
    pub fn wait_for_ready(&self, label: &str, max_wait_secs: u64) -> bool {
        for _ in 0..max_wait_secs {
            if self.model_loaded(label) {
                return true;
            }
            thread::sleep(Duration::from_secs(1));
        }
        false
    }
}

#[derive(Debug, Clone)]
pub struct CaptionRunOptions {
    pub directory: PathBuf,
    /// Display label or raw identifier; the API name is derived.
    pub model: String,
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub temperature: f64,
    pub max_tokens: u32,
    pub overwrite_existing: bool,
}

/// Captions every image in a directory, one request at a time. Images
/// with an existing sibling `.txt` are skipped unless overwriting; a
/// failure on one image is logged and the loop continues. Always returns
/// a status line, never a fault.
pub fn caption_directory(
    client: &VisionClient,
    options: &CaptionRunOptions,
    log: Option<&RunLog>,
) -> String {
    let directory = &options.directory;
    if !directory.is_dir() {
        return format!("ERROR: Directory not found: {}", directory.display());
    }
    let image_files = match list_image_files(directory) {
        Ok(files) => files,
        Err(err) => return format!("ERROR: Could not read directory: {err:#}"),
    };
    if image_files.is_empty() {
        return format!("NO IMAGES found in: {}", directory.display());
    }

    let api_model = catalog::api_model_name(&options.model).to_string();
    println!(
        "[glimpse] Starting captioning for {} images...",
        image_files.len()
    );
    println!(
        "[glimpse] Model: {} | Server: {}",
        api_model,
        client.server_url()
    );
    println!("[glimpse] Overwrite: {}", options.overwrite_existing);
    record(
        log,
        "run_started",
        fields(json!({
            "directory": directory.display().to_string(),
            "model": api_model,
            "total_images": image_files.len(),
        })),
    );

    let describe_options = DescribeOptions {
        model: api_model,
        prompt: options.prompt.clone(),
        system_prompt: options.system_prompt.clone(),
        temperature: options.temperature,
        max_tokens: options.max_tokens,
    };

    let mut captioned: u64 = 0;
    let mut skipped: u64 = 0;
    for file_name in &image_files {
        let image_path = directory.join(file_name);
        let caption_path = image_path.with_extension("txt");

        if !options.overwrite_existing && caption_path.exists() {
            println!("[glimpse] Caption for '{file_name}' already exists. Skipping.");
            skipped += 1;
            record(log, "caption_skipped", fields(json!({ "file": file_name })));
            continue;
        }

        println!("[glimpse] Processing: {file_name}...");
        let Some(image_base64) = encode_image_from_path(&image_path) else {
            println!("[glimpse] Error encoding '{file_name}'. Skipping.");
            record(
                log,
                "caption_failed",
                fields(json!({ "file": file_name, "reason": "encode" })),
            );
            continue;
        };

        match client.describe(&describe_options, &image_base64) {
            Ok(caption) => {
                let caption = caption.trim();
                if let Err(err) = fs::write(&caption_path, caption) {
                    println!("[glimpse] Error writing caption for '{file_name}': {err}");
                    record(
                        log,
                        "caption_failed",
                        fields(json!({ "file": file_name, "reason": "write" })),
                    );
                    continue;
                }
                println!("[glimpse] Caption for '{file_name}' saved.");
                captioned += 1;
                record(log, "caption_saved", fields(json!({ "file": file_name })));
            }
            Err(err) => {
                println!("[glimpse] Error processing '{file_name}': {err}");
                record(
                    log,
                    "caption_failed",
                    fields(json!({ "file": file_name, "reason": err.to_string() })),
                );
            }
        }
    }

    let status = format!(
        "Captioning finished. {captioned} new captions created. {skipped} files skipped. \
         (Total images: {})",
        image_files.len()
    );
    record(
        log,
        "run_finished",
        fields(json!({
            "captioned": captioned,
            "skipped": skipped,
            "total_images": image_files.len(),
        })),
    );
    status
}

fn list_image_files(directory: &Path) -> Result<Vec<String>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(directory)
        .with_context(|| format!("failed reading {}", directory.display()))?
    {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let extension = Path::new(&name)
            .extension()
            .map(|ext| ext.to_string_lossy().to_lowercase());
        if let Some(extension) = extension {
            if IMAGE_EXTENSIONS.contains(&extension.as_str()) {
                files.push(name);
            }
        }
    }
    files.sort();
    Ok(files)
}

fn record(log: Option<&RunLog>, event: &str, fields: EventFields) {
    if let Some(log) = log {
        if let Err(err) = log.record(event, fields) {
            eprintln!("[glimpse] event log write failed: {err:#}");
        }
    }
}

fn fields(value: Value) -> EventFields {
    value.as_object().cloned().unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedImage {
    pub path: PathBuf,
    pub counter: u32,
}

/// One-method capability for persisting an image with its prompt text.
/// Callers compose over this instead of inheriting a save implementation.
pub trait PromptImageStore {
    fn save(
        &mut self,
        image: &RgbImage,
        prefix: &str,
        prompt_text: Option<&str>,
    ) -> Result<SavedImage>;
}

/// Writes `<prefix>_<counter:05>_.png` (and an optional sibling `.txt`)
/// into a managed output directory. The counter continues from the
/// highest existing file for that prefix.
pub struct DirectoryStore {
    output_dir: PathBuf,
}

impl DirectoryStore {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    fn next_counter(&self, prefix: &str) -> u32 {
        let Ok(entries) = fs::read_dir(&self.output_dir) else {
            return 1;
        };
        let lead = format!("{prefix}_");
        let mut highest = 0;
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(rest) = name.strip_prefix(&lead) else {
                continue;
            };
            let Some(digits) = rest.strip_suffix("_.png") else {
                continue;
            };
            if let Ok(counter) = digits.parse::<u32>() {
                highest = highest.max(counter);
            }
        }
        highest + 1
    }
}

impl PromptImageStore for DirectoryStore {
    fn save(
        &mut self,
        image: &RgbImage,
        prefix: &str,
        prompt_text: Option<&str>,
    ) -> Result<SavedImage> {
        fs::create_dir_all(&self.output_dir)
            .with_context(|| format!("failed creating {}", self.output_dir.display()))?;
        let counter = self.next_counter(prefix);
        let stem = format!("{prefix}_{counter:05}_");
        let path = self.output_dir.join(format!("{stem}.png"));
        image
            .save(&path)
            .with_context(|| format!("failed saving {}", path.display()))?;

        if let Some(text) = prompt_text {
            let text_path = self.output_dir.join(format!("{stem}.txt"));
            // A failed prompt write must not lose the image.
            if let Err(err) = fs::write(&text_path, text) {
                eprintln!(
                    "[glimpse] Error writing prompt file {}: {err}",
                    text_path.display()
                );
            }
        }
        Ok(SavedImage { path, counter })
    }
}

#[derive(Debug)]
struct CommandOutput {
    success: bool,
    code: Option<i32>,
    stdout: String,
    stderr: String,
}

#[derive(Debug)]
enum CommandError {
    Timeout(Duration),
    Failed(anyhow::Error),
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandError::Timeout(timeout) => {
                write!(f, "command timed out after {}s", timeout.as_secs())
            }
            CommandError::Failed(err) => write!(f, "{err:#}"),
        }
    }
}

impl std::error::Error for CommandError {}

/// Runs a subprocess to completion with a deadline. std has no built-in
/// subprocess timeout, so this polls `try_wait` and kills the child when
/// the deadline passes.
fn run_with_timeout(
    mut command: Command,
    timeout: Duration,
) -> Result<CommandOutput, CommandError> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = command
        .spawn()
        .map_err(|err| CommandError::Failed(anyhow::Error::new(err).context("spawn failed")))?;

    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(_)) => break,
            Ok(None) => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(CommandError::Timeout(timeout));
                }
                thread::sleep(Duration::from_millis(100));
            }
            Err(err) => return Err(CommandError::Failed(anyhow::Error::new(err))),
        }
    }

    let output = child
        .wait_with_output()
        .map_err(|err| CommandError::Failed(anyhow::Error::new(err)))?;
    Ok(CommandOutput {
        success: output.status.success(),
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    let truncated: String = value.chars().take(max_chars).collect();
    format!("{truncated}…")
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::{TcpListener, TcpStream};

    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    use glimpse_contracts::catalog::{CatalogEntry, ModelCatalog};
    use serde_json::Value;

    use super::*;

    fn describe_options() -> DescribeOptions {
        DescribeOptions {
            model: "llava-v1.5-7b".to_string(),
            prompt: "Describe this image in detail.".to_string(),
            system_prompt: None,
            temperature: 0.7,
            max_tokens: 500,
        }
    }

    fn tiny_image(width: u32, height: u32) -> RgbImage {
        let mut image = RgbImage::new(width, height);
        for (x, y, pixel) in image.enumerate_pixels_mut() {
            *pixel = image::Rgb([(x % 256) as u8, (y % 256) as u8, 7]);
        }
        image
    }

    /// Minimal loopback HTTP server: answers `requests` requests with the
    /// given status line and body, reading each request fully first.
    fn spawn_server(
        status_line: &'static str,
        body: &'static str,
        requests: usize,
    ) -> (String, thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback");
        let addr = listener.local_addr().expect("local addr");
        let handle = thread::spawn(move || {
            for _ in 0..requests {
                let Ok((mut stream, _)) = listener.accept() else {
                    return;
                };
                consume_request(&mut stream);
                let response = format!(
                    "HTTP/1.1 {status_line}\r\nContent-Type: application/json\r\n\
                     Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(response.as_bytes());
                let _ = stream.flush();
            }
        });
        (format!("http://{addr}"), handle)
    }

    fn consume_request(stream: &mut TcpStream) {
        let mut reader = BufReader::new(stream.try_clone().expect("clone stream"));
        let mut content_length = 0usize;
        loop {
            let mut line = String::new();
            if reader.read_line(&mut line).unwrap_or(0) == 0 {
                return;
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                break;
            }
            if let Some((name, value)) = trimmed.split_once(':') {
                if name.eq_ignore_ascii_case("content-length") {
                    content_length = value.trim().parse().unwrap_or(0);
                }
            }
        }
        let mut body = vec![0u8; content_length];
        let _ = reader.read_exact(&mut body);
    }

    fn refused_url() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback");
        let addr = listener.local_addr().expect("local addr");
        drop(listener);
        format!("http://{addr}")
    }

    #[test]
    fn encoder_produces_png_with_source_dimensions() {
        let encoded = encode_rgb_image(&tiny_image(5, 3)).expect("encodes");
        let bytes = BASE64.decode(encoded).expect("valid base64");
        assert_eq!(
            image::guess_format(&bytes).expect("guessable"),
            ImageFormat::Png
        );
        let decoded = image::load_from_memory(&bytes).expect("decodes").to_rgb8();
        assert_eq!(decoded.dimensions(), (5, 3));
    }

    #[test]
    fn encoder_reencodes_jpeg_sources_to_png() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let source = temp.path().join("photo.jpg");
        tiny_image(8, 4).save(&source)?;

        let encoded = encode_image_from_path(&source).expect("encodes");
        let bytes = BASE64.decode(encoded)?;
        assert_eq!(image::guess_format(&bytes)?, ImageFormat::Png);
        let decoded = image::load_from_memory(&bytes)?.to_rgb8();
        assert_eq!(decoded.dimensions(), (8, 4));
        Ok(())
    }

    #[test]
    fn encoder_reports_unreadable_files_as_none() {
        assert!(encode_image_from_path(Path::new("/nonexistent/image.png")).is_none());
    }

    #[test]
    fn describe_returns_the_first_choice_content() -> anyhow::Result<()> {
        let (url, handle) = spawn_server(
            "200 OK",
            r#"{"choices":[{"message":{"role":"assistant","content":"X"}}]}"#,
            1,
        );
        let client = VisionClient::new(&url)?;
        let caption = client
            .describe(&describe_options(), "QUJD")
            .expect("caption");
        assert_eq!(caption, "X");
        handle.join().expect("server thread");
        Ok(())
    }

    #[test]
    fn http_404_is_classified_with_the_vision_hint() -> anyhow::Result<()> {
        let (url, handle) = spawn_server("404 Not Found", r#"{"error":"model not found"}"#, 1);
        let client = VisionClient::new(&url)?;
        let err = client
            .describe(&describe_options(), "QUJD")
            .expect_err("must fail");
        assert!(matches!(err, VisionError::Http { status: 404, .. }));
        let message = err.to_string();
        assert!(message.contains("404"));
        assert!(message.contains("HINT: Is the vision model loaded"));
        handle.join().expect("server thread");
        Ok(())
    }

    #[test]
    fn unsupported_image_body_adds_the_model_hint() -> anyhow::Result<()> {
        let (url, handle) = spawn_server(
            "400 Bad Request",
            r#"{"error":"model does not support images"}"#,
            1,
        );
        let client = VisionClient::new(&url)?;
        let message = client
            .describe(&describe_options(), "QUJD")
            .expect_err("must fail")
            .to_string();
        assert!(message.contains("400"));
        assert!(message.contains("does not support images"));
        assert!(message.contains("Load a vision"));
        handle.join().expect("server thread");
        Ok(())
    }

    #[test]
    fn connection_refusal_is_distinct_from_http_failure() -> anyhow::Result<()> {
        let client = VisionClient::new(&refused_url())?;
        let err = client
            .describe(&describe_options(), "QUJD")
            .expect_err("must fail");
        assert!(matches!(err, VisionError::Connect { .. }));
        let message = err.to_string();
        assert!(message.contains("Connection Error"));
        assert!(!message.contains("HTTP Error"));
        Ok(())
    }

    #[test]
    fn missing_content_is_a_payload_error() -> anyhow::Result<()> {
        let (url, handle) = spawn_server("200 OK", r#"{"choices":[{"message":{}}]}"#, 1);
        let client = VisionClient::new(&url)?;
        let err = client
            .describe(&describe_options(), "QUJD")
            .expect_err("must fail");
        assert!(matches!(err, VisionError::Payload(_)));
        handle.join().expect("server thread");
        Ok(())
    }

    #[test]
    fn describe_file_or_message_fills_the_output_slot() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let source = temp.path().join("photo.png");
        tiny_image(2, 2).save(&source)?;

        let client = VisionClient::new(&refused_url())?;
        let output = client.describe_file_or_message(&describe_options(), &source);
        assert!(output.contains("Connection Error"));
        Ok(())
    }

    #[test]
    fn captioner_skips_existing_captions_and_processes_the_rest() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        tiny_image(2, 2).save(temp.path().join("a.png"))?;
        fs::write(temp.path().join("a.txt"), "already captioned")?;
        tiny_image(2, 2).save(temp.path().join("b.png"))?;
        fs::write(temp.path().join("notes.md"), "not an image")?;

        let (url, handle) = spawn_server(
            "200 OK",
            r#"{"choices":[{"message":{"content":"  a small test image  "}}]}"#,
            1,
        );
        let client = VisionClient::new(&url)?;
        let log_path = temp.path().join("events.jsonl");
        let log = RunLog::new(&log_path, "run-1");
        let options = CaptionRunOptions {
            directory: temp.path().to_path_buf(),
            model: "llava-v1.5-7b (V)".to_string(),
            prompt: "Describe this image.".to_string(),
            system_prompt: None,
            temperature: 0.7,
            max_tokens: 500,
            overwrite_existing: false,
        };

        let status = caption_directory(&client, &options, Some(&log));
        assert!(status.contains("1 new captions created"));
        assert!(status.contains("1 files skipped"));
        assert!(status.contains("Total images: 2"));

        assert_eq!(fs::read_to_string(temp.path().join("a.txt"))?, "already captioned");
        assert_eq!(
            fs::read_to_string(temp.path().join("b.txt"))?,
            "a small test image"
        );

        let events: Vec<String> = fs::read_to_string(&log_path)?
            .lines()
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .filter_map(|row| row.get("event").and_then(Value::as_str).map(str::to_string))
            .collect();
        assert_eq!(
            events,
            vec!["run_started", "caption_skipped", "caption_saved", "run_finished"]
        );
        handle.join().expect("server thread");
        Ok(())
    }

    #[test]
    fn captioner_reports_a_missing_directory() -> anyhow::Result<()> {
        let client = VisionClient::new("http://localhost:1")?;
        let options = CaptionRunOptions {
            directory: PathBuf::from("/nonexistent/captions"),
            model: "llava-v1.5-7b".to_string(),
            prompt: String::new(),
            system_prompt: None,
            temperature: 0.7,
            max_tokens: 500,
            overwrite_existing: false,
        };
        let status = caption_directory(&client, &options, None);
        assert!(status.starts_with("ERROR: Directory not found"));
        Ok(())
    }

    #[test]
    fn store_allocates_counters_and_writes_the_prompt() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut store = DirectoryStore::new(temp.path().join("out"));

        let first = store.save(&tiny_image(2, 2), "render", Some("a boat"))?;
        assert_eq!(first.counter, 1);
        assert!(first.path.ends_with("render_00001_.png"));
        assert_eq!(
            fs::read_to_string(store.output_dir().join("render_00001_.txt"))?,
            "a boat"
        );

        let second = store.save(&tiny_image(2, 2), "render", None)?;
        assert_eq!(second.counter, 2);
        assert!(!store.output_dir().join("render_00002_.txt").exists());
        Ok(())
    }

    #[test]
    fn store_counter_resumes_after_existing_files() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let out = temp.path().join("out");
        fs::create_dir_all(&out)?;
        tiny_image(2, 2).save(out.join("render_00007_.png"))?;
        tiny_image(2, 2).save(out.join("other_00050_.png"))?;

        let mut store = DirectoryStore::new(&out);
        let saved = store.save(&tiny_image(2, 2), "render", None)?;
        assert_eq!(saved.counter, 8);
        Ok(())
    }

    #[test]
    fn search_terms_match_in_order() {
        let entries = vec![
            CatalogEntry::from_identifier("llava-v1.5-7b").unwrap(),
            CatalogEntry::from_identifier("mistralai/magistral-small-2509").unwrap(),
            CatalogEntry::from_identifier("qwen2-vl-7b-instruct").unwrap(),
        ];
        let manager = ModelManager::new(ModelCatalog::from_entries(entries));

        assert_eq!(
            manager.resolve_search("llava 7b"),
            Some("llava-v1.5-7b".to_string())
        );
        assert_eq!(
            manager.resolve_search("MISTRALAI small"),
            Some("mistralai/magistral-small-2509".to_string())
        );
        assert_eq!(manager.resolve_search("7b llava"), None);
        assert_eq!(manager.resolve_search("pixtral"), None);
    }

    #[test]
    fn resolve_path_prefers_the_catalog_mapping() {
        let entries = vec![CatalogEntry::from_identifier("mistralai/magistral-small-2509").unwrap()];
        let manager = ModelManager::new(ModelCatalog::from_entries(entries));
        assert_eq!(
            manager.resolve_path("mistralai/magistral-small-2509 (V)"),
            "mistralai/magistral-small-2509"
        );
        // Unknown labels are treated as identifiers, annotation stripped.
        assert_eq!(manager.resolve_path("pixtral-12b (V)"), "pixtral-12b");
    }

    #[test]
    fn gpu_flags_follow_mode_and_model_size() {
        assert_eq!(GpuMode::GpuOnly.flag(true), "--gpu=max");
        assert_eq!(GpuMode::Hybrid.flag(false), "--gpu=1");
        assert_eq!(GpuMode::CpuOnly.flag(false), "--gpu=0");
        assert_eq!(GpuMode::Auto.flag(true), "--gpu=1");
        assert_eq!(GpuMode::Auto.flag(false), "--gpu=max");

        assert!(is_large_model("google/gemma-3-27b (V)"));
        assert!(is_large_model("llama-3-70b-instruct"));
        assert!(!is_large_model("llava-v1.5-7b"));
    }

    #[test]
    fn run_with_timeout_captures_output() {
        let mut command = Command::new("echo");
        command.arg("hello");
        let output = run_with_timeout(command, Duration::from_secs(5)).expect("echo runs");
        assert!(output.success);
        assert_eq!(output.stdout.trim(), "hello");
    }

    #[test]
    fn run_with_timeout_kills_overrunning_commands() {
        let mut command = Command::new("sleep");
        command.arg("5");
        let started = Instant::now();
        let err = run_with_timeout(command, Duration::from_millis(300)).expect_err("must time out");
        assert!(matches!(err, CommandError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn truncate_text_keeps_short_values_intact() {
        assert_eq!(truncate_text("short", 512), "short");
        let long = "x".repeat(600);
        let truncated = truncate_text(&long, 512);
        assert!(truncated.chars().count() <= 513);
        assert!(truncated.ends_with('…'));
    }
}
