use std::sync::Arc;

use candle_core::Tensor;

use crate::config::{ArchitectureConfig, ProcessorConfig, ResolutionPolicy};
use crate::error::VlmError;
use crate::processor::{
    assemble, media_dims, split_markers, ImageInput, LmInput, MediaKind, MediaSpec,
    MultimodalProcessor, PromptPart, Segment, VideoInput, VisualInput,
};
use crate::rotary::MediaGrid;
use crate::tokenizer::TextTokenizer;

const IMAGE_MARKER: &str = "<|image_pad|>";
const VIDEO_MARKER: &str = "<|video_pad|>";
const STOP_TOKENS: [&str; 2] = ["<|im_end|>", "<|endoftext|>"];
const MAX_ASPECT_RATIO: usize = 200;
const DEFAULT_FPS: f64 = 2.0;

/// Size `height` x `width` so both edges are multiples of `factor` and the pixel count
/// stays within `[min_pixels, max_pixels]`, keeping the aspect ratio as close as possible.
pub fn smart_resize(
    height: usize,
    width: usize,
    factor: usize,
    min_pixels: usize,
    max_pixels: usize,
) -> Result<(usize, usize), VlmError> {
    if height == 0 || width == 0 || factor == 0 {
        return Err(VlmError::InvalidMedia(format!(
            "cannot resize a {height}x{width} source to multiples of {factor}"
        )));
    }
    if height.max(width) / height.min(width) > MAX_ASPECT_RATIO {
        return Err(VlmError::InvalidMedia(format!(
            "aspect ratio of {height}x{width} exceeds {MAX_ASPECT_RATIO}"
        )));
    }

    let (h, w, f) = (height as f64, width as f64, factor as f64);
    let snap = |v: f64| ((v / f).round_ties_even() as usize).max(1) * factor;
    let (mut h_bar, mut w_bar) = (snap(h), snap(w));

    if h_bar * w_bar > max_pixels {
        let beta = (h * w / max_pixels as f64).sqrt();
        h_bar = ((h / beta / f).floor() as usize).max(1) * factor;
        w_bar = ((w / beta / f).floor() as usize).max(1) * factor;
    } else if h_bar * w_bar < min_pixels {
        let beta = (min_pixels as f64 / (h * w)).sqrt();
        h_bar = ((h * beta / f).ceil() as usize).max(1) * factor;
        w_bar = ((w * beta / f).ceil() as usize).max(1) * factor;
    }
    Ok((h_bar, w_bar))
}

/// Processor of the Qwen2-VL family: native-resolution patches under a pixel budget.
pub struct Qwen2VlProcessor {
    class: String,
    tokenizer: Arc<dyn TextTokenizer>,
    config: ProcessorConfig,
    min_pixels: usize,
    max_pixels: usize,
    channels: usize,
    image_token_id: u32,
    video_token_id: u32,
    stop_tokens: Vec<u32>,
}

impl Qwen2VlProcessor {
    pub fn new(
        class: &str,
        config: &ProcessorConfig,
        arch: &ArchitectureConfig,
        tokenizer: Arc<dyn TextTokenizer>,
    ) -> Result<Self, VlmError> {
        let ResolutionPolicy::PixelBudget {
            min_pixels,
            max_pixels,
            factor,
        } = config.resolution
        else {
            return Err(VlmError::InvalidConfiguration(format!(
                "{class} needs a pixel-budget resolution policy"
            )));
        };

        let vision = &arch.vision;
        if config.patch_size != vision.patch_size
            || config.merge_size != vision.spatial_merge_size
            || config.temporal_patch_size != vision.temporal_patch_size
        {
            return Err(VlmError::InvalidConfiguration(format!(
                "processor patching {}x{} (merge {}) disagrees with the vision tower \
                 {}x{} (merge {})",
                config.temporal_patch_size,
                config.patch_size,
                config.merge_size,
                vision.temporal_patch_size,
                vision.patch_size,
                vision.spatial_merge_size
            )));
        }
        if factor != config.patch_size * config.merge_size {
            return Err(VlmError::InvalidConfiguration(format!(
                "resize factor {factor} must equal patch size times merge size"
            )));
        }

        let video_token_id = arch.video_token_id.unwrap_or(arch.image_token_id);
        let stop_tokens = STOP_TOKENS
            .iter()
            .filter_map(|t| tokenizer.token_to_id(t))
            .collect();

        Ok(Self {
            class: class.to_string(),
            tokenizer,
            config: config.clone(),
            min_pixels,
            max_pixels,
            channels: vision.num_channels,
            image_token_id: arch.image_token_id,
            video_token_id,
            stop_tokens,
        })
    }

    fn factor(&self) -> usize {
        self.config.patch_size * self.config.merge_size
    }

    /// Flatten `frames` (each `(C, H, W)`) into merge-window-ordered patch rows of
    /// `C * T * P * P` values, repeating the last frame to fill the final temporal patch.
    fn patchify(&self, kind: MediaKind, frames: &[Tensor]) -> Result<VisualInput, VlmError> {
        let what = match kind {
            MediaKind::Image => "image",
            MediaKind::Video => "video frame",
        };
        let Some(first) = frames.first() else {
            return Err(VlmError::InvalidMedia(format!("{what} list is empty")));
        };
        let (h, w) = media_dims(first, self.channels, what)?;
        for frame in frames {
            if media_dims(frame, self.channels, what)? != (h, w) {
                return Err(VlmError::InvalidMedia(
                    "video frames must share one size".to_string(),
                ));
            }
        }
        let factor = self.factor();
        if h % factor != 0 || w % factor != 0 {
            return Err(VlmError::InvalidMedia(format!(
                "{what} of {h}x{w} is not a multiple of {factor}; size it with `media_spec`"
            )));
        }

        let tp = self.config.temporal_patch_size.max(1);
        let mut frames = frames.to_vec();
        while frames.len() % tp != 0 {
            if let Some(last) = frames.last().cloned() {
                frames.push(last);
            }
        }

        let (p, m, c) = (self.config.patch_size, self.config.merge_size, self.channels);
        let (gt, gh, gw) = (frames.len() / tp, h / p, w / p);
        let patches = Tensor::stack(&frames, 0)?
            .reshape(vec![gt, tp, c, gh / m, m, p, gw / m, m, p])?
            .permute(vec![0, 3, 6, 4, 7, 2, 1, 5, 8])?
            .reshape((gt * gh * gw, c * tp * p * p))?;

        Ok(VisualInput {
            kind,
            pixels: patches,
            grid: MediaGrid {
                t: gt,
                h: gh,
                w: gw,
                seconds_per_grid: 0.0,
            },
        })
    }

    fn placeholders(&self, kind: MediaKind, grid: &MediaGrid) -> Segment {
        let m = self.config.merge_size.max(1);
        Segment::Placeholders {
            id: match kind {
                MediaKind::Image => self.image_token_id,
                MediaKind::Video => self.video_token_id,
            },
            count: grid.t * (grid.h / m) * (grid.w / m),
        }
    }
}

/// Seconds between consecutive sampled frames.
fn frame_interval(video: &VideoInput) -> f64 {
    let n = video.frames.len();
    match video.timestamps.as_slice() {
        [first, .., last] if last > first => (last - first) / (video.timestamps.len() - 1) as f64,
        _ if video.duration > 0.0 && n > 0 => video.duration / n as f64,
        _ => 1.0 / DEFAULT_FPS,
    }
}

impl MultimodalProcessor for Qwen2VlProcessor {
    fn processor_class(&self) -> &str {
        &self.class
    }

    fn media_spec(
        &self,
        _kind: MediaKind,
        height: usize,
        width: usize,
    ) -> Result<MediaSpec, VlmError> {
        let (height, width) = smart_resize(
            height,
            width,
            self.factor(),
            self.min_pixels,
            self.max_pixels,
        )?;
        Ok(MediaSpec {
            height,
            width,
            global_view: None,
            image_mean: self.config.image_mean,
            image_std: self.config.image_std,
            rescale_factor: self.config.rescale_factor,
        })
    }

    fn process(
        &self,
        prompt: &str,
        images: &[ImageInput],
        videos: &[VideoInput],
    ) -> Result<LmInput, VlmError> {
        let parts = split_markers(prompt, IMAGE_MARKER, VIDEO_MARKER, images.len(), videos.len())?;
        let mut images = images.iter();
        let mut videos = videos.iter();
        let mut segments = Vec::with_capacity(parts.len());
        let mut visuals = Vec::new();

        for part in parts {
            let visual = match part {
                PromptPart::Text(text) => {
                    segments.push(Segment::Text(text.to_string()));
                    continue;
                }
                PromptPart::Media(MediaKind::Image) => {
                    let Some(image) = images.next() else { break };
                    // a still image fills one temporal patch with copies of itself
                    self.patchify(MediaKind::Image, std::slice::from_ref(&image.pixels))?
                }
                PromptPart::Media(MediaKind::Video) => {
                    let Some(video) = videos.next() else { break };
                    if video.frames.len() > self.config.max_frames {
                        return Err(VlmError::InvalidMedia(format!(
                            "video has {} frames, at most {} are supported",
                            video.frames.len(),
                            self.config.max_frames
                        )));
                    }
                    let mut visual = self.patchify(MediaKind::Video, &video.frames)?;
                    visual.grid.seconds_per_grid =
                        frame_interval(video) * self.config.temporal_patch_size as f64;
                    visual
                }
            };
            segments.push(self.placeholders(visual.kind, &visual.grid));
            visuals.push(visual);
        }

        Ok(LmInput {
            token_ids: assemble(self.tokenizer.as_ref(), &segments)?,
            visuals,
        })
    }

    fn stop_token_ids(&self) -> Vec<u32> {
        self.stop_tokens.clone()
    }
}
