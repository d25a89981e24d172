//! Image-folder dataset: `<root>/train/<class>/*` and `<root>/test/<class>/*`.
//!
//! Class directories are sorted by name to assign the original labels. Every
//! image is decoded, converted to RGB, resized and stored CHW in `[0, 1]`.

use std::fs;
use std::path::{Path, PathBuf};

use cil_core::{Error, InputShape, Result};
use image::imageops::FilterType;
use image::DynamicImage;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::dataset::IncrementalDataset;
use crate::split::DataSplit;

const IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "bmp", "gif"];

pub fn load(name: &str, root: &Path, image_size: u32) -> Result<IncrementalDataset> {
    let train_dir = root.join("train");
    let test_dir = root.join("test");
    let class_names = class_directories(&train_dir)?;
    if class_names.is_empty() {
        return Err(Error::Dataset(format!(
            "no class directories under {}",
            train_dir.display()
        )));
    }

    let train = load_split(&train_dir, &class_names, image_size)?;
    let test = load_split(&test_dir, &class_names, image_size)?;
    info!(
        "Loaded image folder {}: {} classes, {} train / {} test images",
        root.display(),
        class_names.len(),
        train.len(),
        test.len()
    );
    IncrementalDataset::new(name, class_names, train, test)
}

fn class_directories(dir: &Path) -> Result<Vec<String>> {
    if !dir.is_dir() {
        return Err(Error::NotFound(format!("Directory not found: {}", dir.display())));
    }
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.path().is_dir() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .map(|ext| {
            let ext = ext.to_string_lossy().to_lowercase();
            IMAGE_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

fn image_files(dir: &Path) -> Vec<PathBuf> {
    WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file() && is_image(entry.path()))
        .map(|entry| entry.into_path())
        .collect()
}

fn load_split(dir: &Path, class_names: &[String], image_size: u32) -> Result<DataSplit> {
    let mut features = Vec::new();
    let mut labels = Vec::new();

    for (label, class) in class_names.iter().enumerate() {
        let class_dir = dir.join(class);
        if !class_dir.is_dir() {
            debug!("Class {} has no samples under {}", class, dir.display());
            continue;
        }
        for path in image_files(&class_dir) {
            let image = image::open(&path).map_err(|e| {
                Error::Image(format!("Failed to load image {}: {}", path.display(), e))
            })?;
            features.extend(to_chw(&image, image_size));
            labels.push(label);
        }
    }

    let side = image_size as usize;
    DataSplit::new(
        InputShape::Image {
            channels: 3,
            height: side,
            width: side,
        },
        features,
        labels,
    )
}

/// Resize to `size x size` and lay out channels first, scaled to `[0, 1]`.
fn to_chw(image: &DynamicImage, size: u32) -> Vec<f32> {
    let rgb = image
        .resize_exact(size, size, FilterType::Triangle)
        .to_rgb8();
    let mut out = Vec::with_capacity((size * size * 3) as usize);
    for channel in 0..3 {
        for y in 0..size {
            for x in 0..size {
                out.push(rgb.get_pixel(x, y)[channel] as f32 / 255.0);
            }
        }
    }
    out
}
