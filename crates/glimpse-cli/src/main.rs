use std::path::PathBuf;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use glimpse_contracts::catalog;
use glimpse_contracts::events::RunLog;
use glimpse_contracts::naming::{generate_filenames, FilenameSpec, DATE_FORMAT_OPTIONS};
use glimpse_contracts::prompt::{combine_prompts, PromptMode};
use glimpse_engine::{
    caption_directory, default_server_url, list_models, CaptionRunOptions, DescribeOptions,
    DirectoryStore, GpuMode, LoadOptions, ModelManager, PromptImageStore, VisionClient,
};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "glimpse", version, about = "Local VLM captioning toolkit for LM Studio")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Caption a single image with a vision model.
    Describe(DescribeArgs),
    /// Caption every image in a directory, writing sibling .txt files.
    CaptionDir(CaptionDirArgs),
    /// List installed models, vision-capable ones first.
    Models(ModelsArgs),
    /// Load a model through the lms CLI and wait until it is ready.
    Load(LoadArgs),
    /// Unload every loaded model.
    Unload(UnloadArgs),
    /// Probe whether the server answers /v1/models.
    Status(StatusArgs),
    /// Build dated output filenames from name segments.
    Filename(FilenameArgs),
    /// Merge a manual prompt with a generated caption.
    CombinePrompt(CombinePromptArgs),
    /// Store an image plus its prompt text in an output directory.
    Save(SaveArgs),
}

#[derive(Debug, Parser)]
struct DescribeArgs {
    #[arg(long)]
    image: PathBuf,
    #[arg(long, default_value = "Describe this image in detail.")]
    prompt: String,
    #[arg(long, default_value = "llava-v1.5")]
    model: String,
    #[arg(
        long,
        default_value = "You are a helpful AI assistant that describes images accurately."
    )]
    system_prompt: String,
    #[arg(long, default_value_t = 0.7)]
    temperature: f64,
    #[arg(long, default_value_t = 500)]
    max_tokens: u32,
    #[arg(long, default_value_t = default_server_url())]
    server_url: String,
}

#[derive(Debug, Parser)]
struct CaptionDirArgs {
    #[arg(long)]
    dir: PathBuf,
    /// Display label or raw identifier; defaults to the first vision
    /// entry of the installed-model catalog.
    #[arg(long)]
    model: Option<String>,
    #[arg(
        long,
        default_value = "Describe this image in detail in a single paragraph, ideal for \
                         Stable Diffusion. Avoid proper names and create a coherent, short \
                         text. Respond in English."
    )]
    prompt: String,
    #[arg(
        long,
        default_value = "You are a helpful AI assistant that describes images accurately \
                         and always responds in English."
    )]
    system_prompt: String,
    #[arg(long, default_value_t = 0.7)]
    temperature: f64,
    #[arg(long, default_value_t = 500)]
    max_tokens: u32,
    /// Re-caption images that already have a caption file.
    #[arg(long)]
    overwrite: bool,
    #[arg(long, default_value_t = default_server_url())]
    server_url: String,
    /// Append run events to this JSONL file.
    #[arg(long)]
    events: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct ModelsArgs {
    /// Also print the raw identifier behind each display label.
    #[arg(long)]
    raw: bool,
}

#[derive(Debug, Parser)]
struct LoadArgs {
    /// Display label or raw identifier to load.
    #[arg(long, conflicts_with = "search")]
    model: Option<String>,
    /// Search terms resolved against the catalog, first match wins.
    #[arg(long)]
    search: Option<String>,
    #[arg(long, default_value_t = 4096)]
    context_length: u32,
    #[arg(long, value_enum, default_value_t = GpuModeArg::Auto)]
    gpu_mode: GpuModeArg,
    /// Seconds to wait after loading before verification.
    #[arg(long, default_value_t = 10)]
    wait_time: u64,
    /// Extra seconds after unload for VRAM cleanup.
    #[arg(long, default_value_t = 5)]
    unload_wait: u64,
    /// Skip the unload-first step.
    #[arg(long)]
    skip_unload: bool,
    /// Upper bound in seconds on the readiness poll.
    #[arg(long, default_value_t = 20)]
    verify_wait: u64,
}

#[derive(Debug, Parser)]
struct UnloadArgs {
    #[arg(long, default_value_t = 5)]
    unload_wait: u64,
}

#[derive(Debug, Parser)]
struct StatusArgs {
    #[arg(long, default_value_t = default_server_url())]
    server_url: String,
}

#[derive(Debug, Parser)]
struct FilenameArgs {
    #[arg(long, default_value = "Modelname")]
    model_name: String,
    #[arg(long, default_value = "outputs")]
    output_folder: String,
    /// May contain strftime codes; invalid codes keep the literal text.
    #[arg(long, default_value = "")]
    subfolder: String,
    #[arg(long, default_value = "glimpse")]
    name_prefix: String,
    #[arg(long, default_value = "")]
    wf_version: String,
    #[arg(long, default_value = "UPSCALED")]
    upscaled_suffix: String,
    #[arg(long, default_value = "-")]
    delimiter: String,
    #[arg(long, default_value_t = DATE_FORMAT_OPTIONS[0].to_string())]
    date_format: String,
}

#[derive(Debug, Parser)]
struct CombinePromptArgs {
    #[arg(long, default_value = "")]
    manual: String,
    #[arg(long, default_value = "")]
    generated: String,
    #[arg(long, value_enum, default_value_t = PromptModeArg::ManualOnly)]
    mode: PromptModeArg,
    #[arg(long, default_value = ", ")]
    delimiter: String,
}

#[derive(Debug, Parser)]
struct SaveArgs {
    #[arg(long)]
    image: PathBuf,
    #[arg(long)]
    out: PathBuf,
    #[arg(long, default_value = "glimpse")]
    prefix: String,
    /// Written to a sibling .txt next to the stored image.
    #[arg(long)]
    prompt_text: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum GpuModeArg {
    Auto,
    GpuOnly,
    Hybrid,
    CpuOnly,
}

impl From<GpuModeArg> for GpuMode {
    fn from(value: GpuModeArg) -> Self {
        match value {
            GpuModeArg::Auto => GpuMode::Auto,
            GpuModeArg::GpuOnly => GpuMode::GpuOnly,
            GpuModeArg::Hybrid => GpuMode::Hybrid,
            GpuModeArg::CpuOnly => GpuMode::CpuOnly,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum PromptModeArg {
    ManualOnly,
    GeneratedOnly,
    ManualThenGenerated,
    GeneratedThenManual,
    Clear,
}

impl From<PromptModeArg> for PromptMode {
    fn from(value: PromptModeArg) -> Self {
        match value {
            PromptModeArg::ManualOnly => PromptMode::ManualOnly,
            PromptModeArg::GeneratedOnly => PromptMode::GeneratedOnly,
            PromptModeArg::ManualThenGenerated => PromptMode::ManualThenGenerated,
            PromptModeArg::GeneratedThenManual => PromptMode::GeneratedThenManual,
            PromptModeArg::Clear => PromptMode::Clear,
        }
    }
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("glimpse error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Describe(args) => run_describe(args),
        Command::CaptionDir(args) => run_caption_dir(args),
        Command::Models(args) => run_models(args),
        Command::Load(args) => run_load(args),
        Command::Unload(args) => run_unload(args),
        Command::Status(args) => run_status(args),
        Command::Filename(args) => run_filename(args),
        Command::CombinePrompt(args) => run_combine_prompt(args),
        Command::Save(args) => run_save(args),
    }
}

fn run_describe(args: DescribeArgs) -> Result<i32> {
    let client = VisionClient::new(&args.server_url)?;
    let options = DescribeOptions {
        model: catalog::api_model_name(&args.model).to_string(),
        prompt: args.prompt,
        system_prompt: optional_text(args.system_prompt),
        temperature: args.temperature,
        max_tokens: args.max_tokens,
    };
    eprintln!(
        "[glimpse] Sending request to {} ({})...",
        client.server_url(),
        options.model
    );
    let started = Instant::now();
    let output = client.describe_file_or_message(&options, &args.image);
    eprintln!(
        "[glimpse] Generation time: {:.2} seconds",
        started.elapsed().as_secs_f64()
    );
    println!("{output}");
    Ok(0)
}

fn run_caption_dir(args: CaptionDirArgs) -> Result<i32> {
    let model = match args.model {
        Some(model) => model,
        None => {
            let catalog = list_models();
            let label = catalog
                .first_vision_label()
                .or_else(|| catalog.labels().next())
                .context("model catalog is empty")?;
            label.to_string()
        }
    };

    let log = args
        .events
        .as_ref()
        .map(|path| RunLog::new(path, Uuid::new_v4().to_string()));

    let client = VisionClient::new(&args.server_url)?;
    let options = CaptionRunOptions {
        directory: args.dir,
        model,
        prompt: args.prompt,
        system_prompt: optional_text(args.system_prompt),
        temperature: args.temperature,
        max_tokens: args.max_tokens,
        overwrite_existing: args.overwrite,
    };
    let status = caption_directory(&client, &options, log.as_ref());
    println!("{status}");
    Ok(if status.starts_with("ERROR") { 1 } else { 0 })
}

fn run_models(args: ModelsArgs) -> Result<i32> {
    let catalog = list_models();
    for (label, identifier) in catalog.iter() {
        if args.raw {
            println!("{label}\t{identifier}");
        } else {
            println!("{label}");
        }
    }
    Ok(0)
}

fn run_load(args: LoadArgs) -> Result<i32> {
    let manager = ModelManager::new(list_models());
    let label = match (&args.model, &args.search) {
        (Some(model), _) => model.clone(),
        (None, Some(search)) => match manager.resolve_search(search) {
            Some(identifier) => identifier,
            None => {
                println!("No models found matching '{search}'");
                return Ok(1);
            }
        },
        (None, None) => bail!("pass --model or --search"),
    };

    let options = LoadOptions {
        context_length: args.context_length,
        gpu_mode: args.gpu_mode.into(),
        wait_secs: args.wait_time,
        unload_wait_secs: args.unload_wait,
        skip_unload: args.skip_unload,
        verify_wait_secs: args.verify_wait,
    };

    println!("[glimpse] Loading model: {label}");
    println!("[glimpse] Path: {}", manager.resolve_path(&label));
    println!(
        "[glimpse] Context: {} | GPU mode: {:?}",
        options.context_length, args.gpu_mode
    );
    if glimpse_engine::is_large_model(&label) && args.gpu_mode == GpuModeArg::GpuOnly {
        println!(
            "[glimpse] WARNING: large model with gpu-only mode; this will likely \
             exhaust VRAM. Consider --gpu-mode hybrid or auto."
        );
    }

    let outcome = manager.load(&label, &options);
    if outcome.vram_failure {
        println!("[glimpse] VRAM allocation failure reported by the loader.");
        println!("[glimpse] Try: --gpu-mode hybrid, a smaller model (e.g. llava-v1.5-7b,");
        println!("[glimpse] qwen2-vl-7b-instruct, pixtral-12b), a lower --context-length,");
        println!("[glimpse] or a smaller quantization.");
    }
    println!("[glimpse] Model: {}", outcome.api_name);
    println!("[glimpse] Status: {}", outcome.status);
    Ok(if outcome.loaded { 0 } else { 1 })
}

fn run_unload(args: UnloadArgs) -> Result<i32> {
    println!("[glimpse] Unloading all models...");
    if ModelManager::new(list_models()).unload_all(args.unload_wait) {
        println!("[glimpse] All models unloaded");
        Ok(0)
    } else {
        println!("[glimpse] Failed to unload models");
        Ok(1)
    }
}

fn run_status(args: StatusArgs) -> Result<i32> {
    let client = VisionClient::new(&args.server_url)?;
    if client.server_ready() {
        println!("Server ready: {}", client.server_url());
        Ok(0)
    } else {
        println!("Server not reachable: {}", client.server_url());
        Ok(1)
    }
}

fn run_filename(args: FilenameArgs) -> Result<i32> {
    let names = generate_filenames(&FilenameSpec {
        model_name: args.model_name,
        output_folder: args.output_folder,
        subfolder: args.subfolder,
        name_prefix: args.name_prefix,
        wf_version: args.wf_version,
        upscaled_suffix: args.upscaled_suffix,
        delimiter: args.delimiter,
        date_format: args.date_format,
    });
    println!("{}", names.filename);
    println!("{}", names.filename_upscaled);
    Ok(0)
}

fn run_combine_prompt(args: CombinePromptArgs) -> Result<i32> {
    println!(
        "{}",
        combine_prompts(args.mode.into(), &args.manual, &args.generated, &args.delimiter)
    );
    Ok(0)
}

fn run_save(args: SaveArgs) -> Result<i32> {
    let decoded = image::open(&args.image)
        .with_context(|| format!("failed decoding {}", args.image.display()))?
        .to_rgb8();
    let mut store = DirectoryStore::new(&args.out);
    let saved = store.save(&decoded, &args.prefix, args.prompt_text.as_deref())?;
    println!("{}", saved.path.display());
    Ok(0)
}

fn optional_text(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
