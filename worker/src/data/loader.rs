use std::{fs, num::NonZeroU32, path::Path};

use image::imageops::{self, FilterType};

use crate::{Result, WorkerErr};

/// Turns one example file into model input features.
pub trait ExampleLoader: Send + Sync {
    /// Returns the amount of features of every loaded example.
    fn example_len(&self) -> usize;

    /// Loads the example at `path` into `out`.
    ///
    /// # Arguments
    /// * `path` - The example file.
    /// * `out` - The destination, `self.example_len()` features long.
    ///
    /// # Returns
    /// An error if the file can't be read or decoded, corrupt input is never skipped.
    fn load_into(&self, path: &Path, out: &mut [f32]) -> Result<()>;
}

/// Loads images as square RGB tensors with values in `[0, 1]`, channel last.
#[derive(Debug, Clone, Copy)]
pub struct ImageLoader {
    size: u32,
}

impl ImageLoader {
    /// Creates a new `ImageLoader`.
    ///
    /// # Arguments
    /// * `size` - The side of the square every image is resized to.
    pub fn new(size: NonZeroU32) -> Self {
        Self { size: size.get() }
    }
}

impl ExampleLoader for ImageLoader {
    fn example_len(&self) -> usize {
        self.size as usize * self.size as usize * 3
    }

    fn load_into(&self, path: &Path, out: &mut [f32]) -> Result<()> {
        let decode_err = |detail: String| WorkerErr::Decode {
            path: path.to_path_buf(),
            detail,
        };

        if out.len() != self.example_len() {
            return Err(decode_err(format!(
                "expected room for {} features, got {}",
                self.example_len(),
                out.len()
            )));
        }

        let bytes = fs::read(path).map_err(|e| decode_err(e.to_string()))?;
        let decoded = image::load_from_memory(&bytes).map_err(|e| decode_err(e.to_string()))?;

        let rgb = decoded.to_rgb8();
        let resized = imageops::resize(&rgb, self.size, self.size, FilterType::Triangle);

        for (o, &v) in out.iter_mut().zip(resized.as_raw()) {
            *o = v as f32 / 255.0;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use image::{Rgb, RgbImage};

    use super::*;

    #[test]
    fn images_are_resized_and_scaled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("red.png");
        RgbImage::from_pixel(7, 5, Rgb([255, 0, 51])).save(&path).unwrap();

        let loader = ImageLoader::new(NonZeroU32::new(4).unwrap());
        let mut out = vec![0.0; loader.example_len()];
        loader.load_into(&path, &mut out).unwrap();

        assert_eq!(out.len(), 4 * 4 * 3);
        for pixel in out.chunks(3) {
            for (&got, expected) in pixel.iter().zip([1.0f32, 0.0, 0.2]) {
                assert!((got - expected).abs() < 0.01, "{pixel:?}");
            }
        }
    }

    #[test]
    fn corrupt_files_are_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.png");
        fs::write(&path, b"definitely not a png").unwrap();

        let loader = ImageLoader::new(NonZeroU32::new(2).unwrap());
        let mut out = vec![0.0; loader.example_len()];

        assert!(matches!(
            loader.load_into(&path, &mut out),
            Err(WorkerErr::Decode { .. })
        ));
    }
}
