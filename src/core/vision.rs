//! # Vision Support
//!
//! Decides which models may receive images and turns inbound data-URL images
//! into typed content parts. Providers never see data URLs directly; each
//! adapter rebuilds whatever shape its API wants from [`ImageData`].

use log::{debug, warn};
use serde::Deserialize;

use crate::inference::{ContentPart, ImageData};

/// Prompt used when the user attaches images without any text.
pub const IMAGE_ONLY_PROMPT: &str = "What's in this image?";

const FALLBACK_MEDIA_TYPE: &str = "image/jpeg";

/// An image as sent by the client: `{data: "data:image/png;base64,...", type?, name?}`.
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ImageAttachment {
    #[serde(default)]
    pub data: Option<String>,
    #[serde(rename = "type", default)]
    pub media_type: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

impl ImageAttachment {
    fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("Unknown")
    }
}

/// Keyword-based vision capability check.
#[derive(Debug, Clone)]
pub struct VisionPolicy {
    keywords: Vec<String>,
}

impl VisionPolicy {
    /// `keywords` are matched as lower-case substrings of the model id.
    pub fn new(keywords: Vec<String>) -> Self {
        Self {
            keywords: keywords.into_iter().map(|k| k.to_lowercase()).collect(),
        }
    }

    pub fn supports_vision(&self, model_id: &str) -> bool {
        let lower = model_id.to_lowercase();
        self.keywords.iter().any(|keyword| lower.contains(keyword))
    }

    /// User-facing explanation for images sent to a text-only model.
    pub fn unsupported_message(&self, model_id: &str, image_count: usize) -> String {
        let mut examples = self
            .keywords
            .iter()
            .take(5)
            .cloned()
            .collect::<Vec<_>>()
            .join(", ");
        if self.keywords.len() > 5 {
            examples.push_str("...");
        }
        let plural = if image_count == 1 { "" } else { "s" };
        format!(
            "The model '{model_id}' does not support image analysis. \
             You attempted to send {image_count} image{plural}. \
             Please select a vision-capable model (like {examples}) \
             or remove the images to proceed with text-only chat."
        )
    }
}

/// Checks that every image carries a data URL. Returns the first problem found.
pub fn validate_images(images: &[ImageAttachment]) -> Result<(), String> {
    for (i, image) in images.iter().enumerate() {
        let n = i + 1;
        let data = match image.data.as_deref() {
            Some(d) if !d.is_empty() => d,
            _ => return Err(format!("Image {n} is missing 'data' field")),
        };
        if !data.starts_with("data:") {
            return Err(format!(
                "Image {n} data must be a valid data URL starting with 'data:'"
            ));
        }
    }
    Ok(())
}

/// Splits `data:<type>;base64,<payload>` into its media type and payload.
///
/// Returns `None` when there is no comma separator or the payload is empty.
pub fn split_data_url(data_url: &str) -> Option<(Option<String>, String)> {
    let (header, payload) = data_url.split_once(',')?;
    if payload.is_empty() {
        return None;
    }
    let media_type = header
        .strip_prefix("data:")
        .and_then(|rest| rest.split(';').next())
        .filter(|t| t.contains('/'))
        .map(str::to_string);
    Some((media_type, payload.to_string()))
}

/// Builds the multipart content for a vision request: the text (or a default
/// prompt) followed by one image part per usable attachment, in order.
pub fn vision_parts(text: &str, images: &[ImageAttachment]) -> Vec<ContentPart> {
    let prompt = if text.trim().is_empty() {
        IMAGE_ONLY_PROMPT.to_string()
    } else {
        text.to_string()
    };
    let mut parts = vec![ContentPart::Text(prompt)];

    for image in images {
        let Some(data) = image.data.as_deref() else {
            continue;
        };
        match split_data_url(data) {
            Some((header_type, base64)) => {
                let media_type = header_type
                    .or_else(|| image.media_type.clone())
                    .unwrap_or_else(|| FALLBACK_MEDIA_TYPE.to_string());
                debug!("Added image to vision content: {}", image.display_name());
                parts.push(ContentPart::Image(ImageData { media_type, base64 }));
            }
            None => warn!(
                "Skipping image '{}': data URL has no base64 payload",
                image.display_name()
            ),
        }
    }
    parts
}
