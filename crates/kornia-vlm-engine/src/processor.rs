//! Turning a text prompt plus normalized media tensors into model input.

use candle_core::Tensor;

use crate::error::VlmError;
use crate::rotary::MediaGrid;
use crate::tokenizer::TextTokenizer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
}

/// A normalized `(channels, height, width)` image produced by the media collaborator.
#[derive(Debug, Clone)]
pub struct ImageInput {
    pub pixels: Tensor,
    /// Downscaled whole-image view, required by tiling processors when `pixels`
    /// spans more than one tile.
    pub global_view: Option<Tensor>,
}

impl ImageInput {
    pub fn new(pixels: Tensor) -> Self {
        Self {
            pixels,
            global_view: None,
        }
    }

    pub fn with_global_view(mut self, view: Tensor) -> Self {
        self.global_view = Some(view);
        self
    }
}

/// Ordered normalized frames with their timestamps in seconds.
#[derive(Debug, Clone)]
pub struct VideoInput {
    pub frames: Vec<Tensor>,
    pub timestamps: Vec<f64>,
    pub duration: f64,
}

/// Exact tensor the media collaborator must produce for a source of a given size.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaSpec {
    pub height: usize,
    pub width: usize,
    /// Size of the additional whole-image view, if the processor wants one.
    pub global_view: Option<(usize, usize)>,
    pub image_mean: [f32; 3],
    pub image_std: [f32; 3],
    pub rescale_factor: f32,
}

/// One visual item laid out for the vision tower.
#[derive(Debug, Clone)]
pub struct VisualInput {
    pub kind: MediaKind,
    pub pixels: Tensor,
    pub grid: MediaGrid,
}

/// Tokenized prompt plus the visual items its placeholders refer to, in prompt order.
#[derive(Debug, Clone, Default)]
pub struct LmInput {
    pub token_ids: Vec<u32>,
    pub visuals: Vec<VisualInput>,
}

impl LmInput {
    pub fn from_tokens(token_ids: Vec<u32>) -> Self {
        Self {
            token_ids,
            visuals: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.token_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.token_ids.is_empty()
    }
}

/// Architecture-specific prompt and media preparation.
pub trait MultimodalProcessor: Send + Sync {
    fn processor_class(&self) -> &str;

    /// Resolution and normalization the media collaborator must apply to a
    /// `height` x `width` source.
    fn media_spec(
        &self,
        kind: MediaKind,
        height: usize,
        width: usize,
    ) -> Result<MediaSpec, VlmError>;

    /// Expand media markers in `prompt` into placeholder tokens and lay out the media.
    fn process(
        &self,
        prompt: &str,
        images: &[ImageInput],
        videos: &[VideoInput],
    ) -> Result<LmInput, VlmError>;

    /// Token ids that end an assistant turn for this processor's chat format.
    fn stop_token_ids(&self) -> Vec<u32> {
        Vec::new()
    }
}

/// Piece of an expanded prompt.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Segment {
    Text(String),
    Placeholders { id: u32, count: usize },
}

/// Piece of a raw prompt split on media markers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum PromptPart<'a> {
    Text(&'a str),
    Media(MediaKind),
}

/// Split `prompt` on the image and video markers, failing when the number of markers
/// of either kind differs from the number of supplied items.
pub(crate) fn split_markers<'a>(
    prompt: &'a str,
    image_marker: &str,
    video_marker: &str,
    images: usize,
    videos: usize,
) -> Result<Vec<PromptPart<'a>>, VlmError> {
    let mut parts = Vec::new();
    let mut rest = prompt;
    loop {
        let next_image = rest.find(image_marker).map(|i| (i, MediaKind::Image));
        let next_video = rest.find(video_marker).map(|i| (i, MediaKind::Video));
        let next = match (next_image, next_video) {
            (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
            (a, b) => a.or(b),
        };
        let Some((at, kind)) = next else {
            if !rest.is_empty() {
                parts.push(PromptPart::Text(rest));
            }
            break;
        };

        if at > 0 {
            parts.push(PromptPart::Text(&rest[..at]));
        }
        parts.push(PromptPart::Media(kind));
        let marker_len = match kind {
            MediaKind::Image => image_marker.len(),
            MediaKind::Video => video_marker.len(),
        };
        rest = &rest[at + marker_len..];
    }

    let count = |k: MediaKind| parts.iter().filter(|p| **p == PromptPart::Media(k)).count();
    for (kind, supplied) in [(MediaKind::Image, images), (MediaKind::Video, videos)] {
        let markers = count(kind);
        if markers != supplied {
            return Err(VlmError::VisualTokenCountMismatch {
                placeholders: markers,
                features: supplied,
            });
        }
    }
    Ok(parts)
}

/// Tokenize text segments and splice placeholder runs between them.
pub(crate) fn assemble(
    tokenizer: &dyn TextTokenizer,
    segments: &[Segment],
) -> Result<Vec<u32>, VlmError> {
    let mut ids = Vec::new();
    for segment in segments {
        match segment {
            Segment::Text(text) if text.is_empty() => {}
            Segment::Text(text) => ids.extend(tokenizer.encode(text)?),
            Segment::Placeholders { id, count } => {
                ids.extend(std::iter::repeat(*id).take(*count))
            }
        }
    }
    Ok(ids)
}

/// Check a `(channels, height, width)` media tensor and return its spatial size.
pub(crate) fn media_dims(
    tensor: &Tensor,
    channels: usize,
    what: &str,
) -> Result<(usize, usize), VlmError> {
    match tensor.dims() {
        &[c, h, w] if c == channels && h > 0 && w > 0 => Ok((h, w)),
        dims => Err(VlmError::InvalidMedia(format!(
            "{what} must be ({channels}, H, W), got {dims:?}"
        ))),
    }
}
