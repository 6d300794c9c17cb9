use crate::annotations::BoundingBox;
use crate::error::{PipelineError, PipelineResult};
use image::{imageops::FilterType, GrayImage};
use std::path::Path;
use tch::{Kind, Tensor};

pub const CROP_HEIGHT: u32 = 32;
pub const CROP_WIDTH: u32 = 100;

/// Loads `file_path` as grayscale, cuts out `bbox` and returns a
/// `[1, CROP_HEIGHT, CROP_WIDTH]` float tensor with values in `[0, 1]`.
pub fn load_text_crop(file_path: &Path, bbox: &BoundingBox) -> PipelineResult<Tensor> {
    let image = load_grayscale(file_path)?;
    let crop = crop_region(&image, bbox).ok_or_else(|| {
        PipelineError::data_format(
            file_path.display().to_string(),
            format!("bounding box {:?} crops to an empty region", bbox),
        )
    })?;
    let resized = image::imageops::resize(&crop, CROP_WIDTH, CROP_HEIGHT, FilterType::Triangle);
    Ok(convert_image_to_tensor(&resized))
}

pub fn load_grayscale(file_path: &Path) -> PipelineResult<GrayImage> {
    let image = image::open(file_path).map_err(|source| PipelineError::Image {
        path: file_path.to_path_buf(),
        source,
    })?;
    Ok(image.to_luma8())
}

/// Crops `(x, y, x + w, y + h)` with corners rounded half to even. Parts of
/// the box outside the image come out black. Returns `None` for a box without
/// area.
pub fn crop_region(image: &GrayImage, bbox: &BoundingBox) -> Option<GrayImage> {
    let (left, top, right, bottom) = bbox.corners();
    let (left, top) = (left.round_ties_even() as i64, top.round_ties_even() as i64);
    let (width, height) = (
        right.round_ties_even() as i64 - left,
        bottom.round_ties_even() as i64 - top,
    );
    if width <= 0 || height <= 0 {
        return None;
    }
    let (image_w, image_h) = (i64::from(image.width()), i64::from(image.height()));
    let mut crop = GrayImage::new(width as u32, height as u32);
    for (x, y, pixel) in crop.enumerate_pixels_mut() {
        let src_x = left + i64::from(x);
        let src_y = top + i64::from(y);
        if (0..image_w).contains(&src_x) && (0..image_h).contains(&src_y) {
            *pixel = *image.get_pixel(src_x as u32, src_y as u32);
        }
    }
    Some(crop)
}

pub fn convert_image_to_tensor(image: &GrayImage) -> Tensor {
    let (w, h) = (image.width() as i64, image.height() as i64);
    Tensor::from_slice(image.as_raw())
        .view((1, h, w))
        .to_kind(Kind::Float)
        / 255.
}
