use std::io::Cursor;

use image::{ImageFormat, Rgb, RgbImage};
use sha2::{Digest, Sha256};

use super::{DispatchOptions, DispatchResult, ImageProvider, ProviderError};
use crate::media::encode_data_url;

/// Offline provider: a solid-colour PNG whose colour is derived from the
/// prompt and seed.
pub struct DryrunProvider;

impl ImageProvider for DryrunProvider {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn generate(
        &self,
        _model: &str,
        _api_key: Option<&str>,
        options: &DispatchOptions,
    ) -> DispatchResult<String> {
        let width = options.dimensions.width.max(1);
        let height = options.dimensions.height.max(1);
        let (r, g, b) = color_from_prompt(&options.prompt, options.params.seed.unwrap_or_default() as u64);
        let image = RgbImage::from_pixel(width, height, Rgb([r, g, b]));
        let mut bytes = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .map_err(|err| ProviderError::fatal(self.name(), format!("dryrun PNG encode failed: {err}")))?;
        Ok(encode_data_url("image/png", &bytes))
    }
}

pub(crate) fn color_from_prompt(prompt: &str, seed: u64) -> (u8, u8, u8) {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    hasher.update(seed.to_be_bytes());
    let digest = hasher.finalize();
    (digest[0], digest[1], digest[2])
}

#[cfg(test)]
mod tests {
    use etherscape_contracts::dimensions::Dimensions;

    use super::{color_from_prompt, DryrunProvider};
    use crate::dispatch::{DispatchOptions, ImageProvider};
    use crate::media::decode_data_url;

    #[test]
    fn renders_png_of_requested_size() -> anyhow::Result<()> {
        let options = DispatchOptions::new("Cosmic jellyfish", Dimensions { width: 64, height: 32 }, "2:1");
        let url = DryrunProvider.generate("dryrun-image-1", None, &options)?;
        let decoded = decode_data_url(&url).unwrap_or_else(|| panic!("not a data URL"));
        assert_eq!(decoded.mime_type, "image/png");
        let image = image::load_from_memory(&decoded.bytes)?;
        assert_eq!((image.width(), image.height()), (64, 32));
        Ok(())
    }

    #[test]
    fn colour_depends_on_prompt_and_seed() {
        assert_eq!(color_from_prompt("a", 1), color_from_prompt("a", 1));
        assert_ne!(color_from_prompt("a", 1), color_from_prompt("a", 2));
    }
}
