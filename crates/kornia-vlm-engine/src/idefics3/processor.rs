use std::sync::Arc;

use candle_core::Tensor;
use num2words::Num2Words;

use crate::config::{ArchitectureConfig, ProcessorConfig, ResolutionPolicy};
use crate::error::VlmError;
use crate::processor::{
    assemble, media_dims, split_markers, ImageInput, LmInput, MediaKind, MediaSpec,
    MultimodalProcessor, PromptPart, Segment, VideoInput, VisualInput,
};
use crate::rotary::MediaGrid;
use crate::tokenizer::TextTokenizer;

const IMAGE_MARKER: &str = "<image>";
const VIDEO_MARKER: &str = "<video>";
const FAKE_TOKEN: &str = "<fake_token_around_image>";
const GLOBAL_TOKEN: &str = "<global-img>";
const END_OF_UTTERANCE: &str = "<end_of_utterance>";
const DEFAULT_MEDIA_OUTTRO: &str = "\n\n";

/// Scale so the longest edge equals `longest_edge`, keeping the aspect ratio.
pub fn resize_longest_edge(height: usize, width: usize, longest_edge: usize) -> (usize, usize) {
    if width >= height {
        let h = (longest_edge * height / width.max(1)).max(1);
        (h, longest_edge)
    } else {
        let w = (longest_edge * width / height.max(1)).max(1);
        (longest_edge, w)
    }
}

/// Round both edges up to whole tiles.
pub fn round_to_tiles(height: usize, width: usize, tile_edge: usize) -> (usize, usize) {
    (
        height.div_ceil(tile_edge) * tile_edge,
        width.div_ceil(tile_edge) * tile_edge,
    )
}

fn format_duration(seconds: f64) -> String {
    let secs = seconds.max(0.0) as u64;
    format!("{:01}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

fn format_timestamp(seconds: f64) -> String {
    let secs = seconds.max(0.0) as u64;
    format!("{:02}:{:02}", secs / 60, secs % 60)
}

/// Tile-based processor of the Idefics3/SmolVLM family.
pub struct Idefics3Processor {
    class: String,
    tokenizer: Arc<dyn TextTokenizer>,
    config: ProcessorConfig,
    tile_edge: usize,
    longest_edge: usize,
    channels: usize,
    image_token_id: u32,
    end_of_utterance: Option<u32>,
}

impl Idefics3Processor {
    pub fn new(
        class: &str,
        config: &ProcessorConfig,
        arch: &ArchitectureConfig,
        tokenizer: Arc<dyn TextTokenizer>,
    ) -> Result<Self, VlmError> {
        let ResolutionPolicy::Tiled {
            tile_edge,
            longest_edge,
        } = config.resolution
        else {
            return Err(VlmError::InvalidConfiguration(format!(
                "{class} needs a tiled resolution policy"
            )));
        };

        if tile_edge != arch.vision.image_size {
            return Err(VlmError::InvalidConfiguration(format!(
                "tile edge {tile_edge} differs from the vision input size {}",
                arch.vision.image_size
            )));
        }
        let side = tile_edge / arch.vision.patch_size / arch.scale_factor;
        if config.image_seq_len != side * side {
            return Err(VlmError::InvalidConfiguration(format!(
                "`image_seq_len` {} does not match the {} features produced per tile",
                config.image_seq_len,
                side * side
            )));
        }

        Ok(Self {
            class: class.to_string(),
            end_of_utterance: tokenizer.token_to_id(END_OF_UTTERANCE),
            tokenizer,
            config: config.clone(),
            tile_edge,
            longest_edge,
            channels: arch.vision.num_channels,
            image_token_id: arch.image_token_id,
        })
    }

    fn placeholders(&self) -> Segment {
        Segment::Placeholders {
            id: self.image_token_id,
            count: self.config.image_seq_len,
        }
    }

    fn single_view(&self, segments: &mut Vec<Segment>) {
        segments.push(Segment::Text(format!("{FAKE_TOKEN}{GLOBAL_TOKEN}")));
        segments.push(self.placeholders());
        segments.push(Segment::Text(FAKE_TOKEN.to_string()));
    }

    fn expand_image(
        &self,
        image: &ImageInput,
        segments: &mut Vec<Segment>,
    ) -> Result<VisualInput, VlmError> {
        let (h, w) = media_dims(&image.pixels, self.channels, "image")?;
        let tile = self.tile_edge;
        if h % tile != 0 || w % tile != 0 {
            return Err(VlmError::InvalidMedia(format!(
                "image of {h}x{w} is not a whole number of {tile}px tiles"
            )));
        }
        let (rows, cols) = (h / tile, w / tile);

        let views = if rows * cols == 1 {
            self.single_view(segments);
            vec![image.pixels.clone()]
        } else {
            let global = image.global_view.as_ref().ok_or_else(|| {
                VlmError::InvalidMedia(format!(
                    "a {rows}x{cols} tiled image needs a {tile}x{tile} global view"
                ))
            })?;
            if media_dims(global, self.channels, "global view")? != (tile, tile) {
                return Err(VlmError::InvalidMedia(format!(
                    "global view must be {tile}x{tile}, got {:?}",
                    global.dims()
                )));
            }

            let mut views = Vec::with_capacity(rows * cols + 1);
            for r in 0..rows {
                for c in 0..cols {
                    segments.push(Segment::Text(format!(
                        "{FAKE_TOKEN}<row_{}_col_{}>",
                        r + 1,
                        c + 1
                    )));
                    segments.push(self.placeholders());
                    views.push(
                        image
                            .pixels
                            .narrow(1, r * tile, tile)?
                            .narrow(2, c * tile, tile)?,
                    );
                }
                segments.push(Segment::Text("\n".to_string()));
            }
            segments.push(Segment::Text(format!("\n{FAKE_TOKEN}{GLOBAL_TOKEN}")));
            segments.push(self.placeholders());
            segments.push(Segment::Text(FAKE_TOKEN.to_string()));
            views.push(global.clone());
            views
        };

        self.visual(MediaKind::Image, &views)
    }

    fn expand_video(
        &self,
        video: &VideoInput,
        segments: &mut Vec<Segment>,
    ) -> Result<VisualInput, VlmError> {
        let frames = video.frames.len();
        if frames == 0 || frames > self.config.max_frames {
            return Err(VlmError::InvalidMedia(format!(
                "video must have 1..={} frames, got {frames}",
                self.config.max_frames
            )));
        }
        if video.timestamps.len() != frames {
            return Err(VlmError::InvalidMedia(format!(
                "{frames} frames but {} timestamps",
                video.timestamps.len()
            )));
        }
        for frame in &video.frames {
            let dims = media_dims(frame, self.channels, "video frame")?;
            if dims != (self.tile_edge, self.tile_edge) {
                return Err(VlmError::InvalidMedia(format!(
                    "video frames must be {0}x{0}, got {dims:?}",
                    self.tile_edge
                )));
            }
        }

        let count = Num2Words::new(frames as i64)
            .cardinal()
            .to_words()
            .map_err(|e| VlmError::InvalidMedia(format!("frame count: {e:?}")))?;
        segments.push(Segment::Text(format!(
            "You are provided the following series of {count} frames from a {} [H:MM:SS] video.\n",
            format_duration(video.duration)
        )));
        for &ts in &video.timestamps {
            segments.push(Segment::Text(format!(
                "\nFrame from {}:",
                format_timestamp(ts)
            )));
            self.single_view(segments);
        }
        segments.push(Segment::Text(DEFAULT_MEDIA_OUTTRO.to_string()));

        self.visual(MediaKind::Video, &video.frames)
    }

    fn visual(&self, kind: MediaKind, views: &[Tensor]) -> Result<VisualInput, VlmError> {
        let side = self.tile_edge / self.config.patch_size.max(1);
        Ok(VisualInput {
            kind,
            pixels: Tensor::stack(views, 0)?,
            grid: MediaGrid {
                t: views.len(),
                h: side,
                w: side,
                seconds_per_grid: 0.0,
            },
        })
    }
}

impl MultimodalProcessor for Idefics3Processor {
    fn processor_class(&self) -> &str {
        &self.class
    }

    fn media_spec(
        &self,
        kind: MediaKind,
        height: usize,
        width: usize,
    ) -> Result<MediaSpec, VlmError> {
        if height == 0 || width == 0 {
            return Err(VlmError::InvalidMedia(format!(
                "empty source of {height}x{width}"
            )));
        }
        let tile = self.tile_edge;
        let (h, w, global_view) = match kind {
            MediaKind::Video => (tile, tile, None),
            MediaKind::Image => {
                let (h, w) = resize_longest_edge(height, width, self.longest_edge);
                let (h, w) = round_to_tiles(h, w, tile);
                let global = (h != tile || w != tile).then_some((tile, tile));
                (h, w, global)
            }
        };
        Ok(MediaSpec {
            height: h,
            width: w,
            global_view,
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

        let mut segments = Vec::new();
        let mut visuals = Vec::new();
        let (mut images, mut videos) = (images.iter(), videos.iter());
        for part in parts {
            match part {
                PromptPart::Text(text) => segments.push(Segment::Text(text.to_string())),
                PromptPart::Media(MediaKind::Image) => {
                    if let Some(image) = images.next() {
                        visuals.push(self.expand_image(image, &mut segments)?);
                    }
                }
                PromptPart::Media(MediaKind::Video) => {
                    if let Some(video) = videos.next() {
                        visuals.push(self.expand_video(video, &mut segments)?);
                    }
                }
            }
        }

        Ok(LmInput {
            token_ids: assemble(self.tokenizer.as_ref(), &segments)?,
            visuals,
        })
    }

    fn stop_token_ids(&self) -> Vec<u32> {
        self.end_of_utterance.into_iter().collect()
    }
}
