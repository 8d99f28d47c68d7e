use argh::FromArgs;
use std::io::Write;
use std::path::PathBuf;

use kornia_vlm_engine::{
    CheckpointSource, FactoryConfig, GenerationParams, ImageInput, Line, LoraAdapter, Message,
    ModelFactory, Role,
};

#[derive(FromArgs)]
/// Generate text from a vision-language checkpoint
struct Args {
    /// local checkpoint directory or Hugging Face Hub repo id
    #[argh(option, short = 'm', default = "\"HuggingFaceTB/SmolVLM-Instruct\".to_string()")]
    model: String,

    /// hub revision to fetch
    #[argh(option)]
    revision: Option<String>,

    /// prompt to ask the model
    #[argh(option, short = 'p', default = "\"Describe this image.\".to_string()")]
    prompt: String,

    /// safetensors file with normalized `pixel_values` (and optionally `global_view`)
    #[argh(option, short = 'i')]
    pixels: Option<PathBuf>,

    /// lora adapter safetensors merged into the weights
    #[argh(option)]
    lora: Option<PathBuf>,

    /// lora scale
    #[argh(option, default = "1.0")]
    lora_scale: f64,

    /// maximum number of generated tokens
    #[argh(option, default = "128")]
    max_tokens: usize,

    /// sampling temperature, 0 for greedy decoding
    #[argh(option, default = "0.0")]
    temperature: f64,

    /// nucleus sampling threshold
    #[argh(option, default = "1.0")]
    top_p: f64,

    /// random seed
    #[argh(option, default = "299792458")]
    seed: u64,

    /// skip the chat template and feed the prompt verbatim
    #[argh(switch)]
    raw: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args: Args = argh::from_env();

    let mut factory = ModelFactory::new(CheckpointSource::parse(&args.model))
        .with_config(FactoryConfig {
            revision: args.revision.clone(),
            ..Default::default()
        })
        .with_progress(|stage| log::debug!("{stage:?}"));
    if let Some(path) = &args.lora {
        factory = factory.with_adapter(LoraAdapter::from_safetensors(path, args.lora_scale)?);
    }
    let context = factory.load()?;

    let images = match &args.pixels {
        Some(path) => {
            let mut tensors = candle_core::safetensors::load(path, context.model().device())?;
            let pixels = tensors
                .remove("pixel_values")
                .ok_or("pixel file has no `pixel_values` tensor")?;
            let mut image = ImageInput::new(pixels);
            if let Some(view) = tensors.remove("global_view") {
                image = image.with_global_view(view);
            }
            vec![image]
        }
        None => Vec::new(),
    };

    let prompt = if args.raw {
        args.prompt.clone()
    } else {
        let mut content = vec![Line::Image; images.len()];
        content.push(Line::Text {
            text: args.prompt.clone(),
        });
        context.apply_chat_template(&[Message::new(Role::User, content)], true)?
    };
    log::info!("prompt: {prompt:?}");

    let input = context.process(&prompt, &images, &[])?;
    let params = GenerationParams {
        max_tokens: args.max_tokens,
        temperature: args.temperature,
        top_p: args.top_p,
        seed: args.seed,
        ..Default::default()
    };

    let mut stdout = std::io::stdout();
    let mut stream = context.generate(input, params)?;
    for token in stream.by_ref() {
        write!(stdout, "{}", token?.text)?;
        stdout.flush()?;
    }
    writeln!(stdout)?;
    log::info!(
        "{} prompt tokens, {} generated, stop: {:?}",
        stream.prompt_tokens(),
        stream.tokens().len(),
        stream.stop_reason()
    );

    Ok(())
}
