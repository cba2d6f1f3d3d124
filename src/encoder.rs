use std::{io::Cursor, path::Path};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use image::ImageFormat;
use serde::{Deserialize, Serialize};

use crate::error::{ChatError, Result};

/// Image formats accepted from the user.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageKind {
    Png,
    Jpeg,
}

impl ImageKind {
    /// Maps a file extension (`png`, `jpg`, `jpeg`) to an image kind.
    pub fn from_extension(extension: &str) -> Option<Self> {
        match extension.to_ascii_lowercase().as_str() {
            "png" => Some(Self::Png),
            "jpg" | "jpeg" => Some(Self::Jpeg),
            _ => None,
        }
    }

    /// Maps a declared content type to an image kind.
    pub fn from_mime(mime: &str) -> Option<Self> {
        match mime {
            "image/png" => Some(Self::Png),
            "image/jpeg" | "image/jpg" => Some(Self::Jpeg),
            _ => None,
        }
    }

    fn format(self) -> ImageFormat {
        match self {
            Self::Png => ImageFormat::Png,
            Self::Jpeg => ImageFormat::Jpeg,
        }
    }
}

/// Raw bytes of an uploaded file plus its declared format.
#[derive(Clone, Debug)]
pub struct UploadedImage {
    pub name: String,
    pub kind: Option<ImageKind>,
    pub bytes: Vec<u8>,
}

impl UploadedImage {
    pub fn new(name: impl Into<String>, kind: Option<ImageKind>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            kind,
            bytes,
        }
    }

    /// Reads an image file, picking its kind from the extension.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .ok_or_else(|| ChatError::Decode("Invalid file extension".to_string()))?;

        let kind = ImageKind::from_extension(extension).ok_or_else(|| {
            ChatError::Decode(format!("Unsupported image format: {}", extension))
        })?;

        let bytes = std::fs::read(path)?;
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        Ok(Self::new(name, Some(kind), bytes))
    }

    /// Encodes the upload for transport.
    pub fn encode(&self) -> Result<EncodedImage> {
        encode_with_kind(&self.bytes, self.kind)
    }
}

/// Base64 of a PNG re-encoding of an uploaded image.
///
/// Serializes as a plain string, which is what the inference server expects in
/// its `images` array.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EncodedImage(String);

impl EncodedImage {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Decodes the base64 payload back into PNG bytes.
    pub fn png_bytes(&self) -> Result<Vec<u8>> {
        STANDARD
            .decode(&self.0)
            .map_err(|e| ChatError::Decode(e.to_string()))
    }

    pub fn to_data_url(&self) -> String {
        format!("data:image/png;base64,{}", self.0)
    }

    /// An `<img>` tag that displays the image inline.
    pub fn to_html(&self) -> String {
        format!(
            r#"<img src="{}" style="max-width: 100%;"/>"#,
            self.to_data_url()
        )
    }
}

/// Decodes `bytes` as PNG or JPEG, re-encodes it as PNG and base64 encodes the
/// result.
pub fn encode(bytes: &[u8]) -> Result<EncodedImage> {
    encode_with_kind(bytes, None)
}

fn encode_with_kind(bytes: &[u8], kind: Option<ImageKind>) -> Result<EncodedImage> {
    // the bytes win over the declared kind, which only matters when they are
    // not recognised
    let format = match (image::guess_format(bytes), kind) {
        (Ok(format @ (ImageFormat::Png | ImageFormat::Jpeg)), _) => format,
        (Ok(other), _) => {
            return Err(ChatError::Decode(format!(
                "Unsupported image format: {:?}",
                other
            )));
        }
        (Err(_), Some(kind)) => kind.format(),
        (Err(e), None) => return Err(ChatError::Decode(e.to_string())),
    };

    let decoded = image::load_from_memory_with_format(bytes, format)
        .map_err(|e| ChatError::Decode(e.to_string()))?;

    let mut png = Vec::new();
    decoded
        .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
        .map_err(|e| ChatError::Decode(e.to_string()))?;

    log::debug!(
        "Encoded {}x{} image into {} png bytes",
        decoded.width(),
        decoded.height(),
        png.len()
    );

    Ok(EncodedImage(STANDARD.encode(png)))
}
