use ndarray::{Array1, Array2, Array3, Array4, Axis};

use crate::{Error, Result, IMAGE_SIDE};

// Raw pixels are 0-255
pub const PIXEL_SCALE: f32 = 255.0;

// (N, 28, 28) -> (N, 28, 28, 1), the channels-last layout the convolution expects
pub fn add_channel_axis(images: Array3<u8>) -> Result<Array4<u8>> {
    let (n, height, width) = images.dim();
    if height != IMAGE_SIDE || width != IMAGE_SIDE {
        return Err(Error::shape(format!(
            "expected {}x{} images, got {}x{}",
            IMAGE_SIDE, IMAGE_SIDE, height, width
        )));
    }
    let images = if images.is_standard_layout() {
        images
    } else {
        images.as_standard_layout().into_owned()
    };
    Ok(images.into_shape((n, IMAGE_SIDE, IMAGE_SIDE, 1))?)
}

// Scale pixel values into [0, 1]
pub fn normalize(images: &Array4<u8>) -> Array4<f32> {
    images.mapv(|pixel| pixel as f32 / PIXEL_SCALE)
}

// Everything the network needs done to a split's images
pub fn prepare_images(images: Array3<u8>) -> Result<Array4<f32>> {
    Ok(normalize(&add_channel_axis(images)?))
}

// One-hot encode class labels.
// Without an explicit class count the width is the largest label + 1.
pub fn to_categorical(labels: &Array1<u8>, num_classes: Option<usize>) -> Result<Array2<f32>> {
    let inferred = labels.iter().max().map_or(0, |&max| max as usize + 1);
    let width = num_classes.unwrap_or(inferred);
    if inferred > width {
        return Err(Error::shape(format!(
            "label {} does not fit in {} classes",
            inferred - 1,
            width
        )));
    }

    let mut one_hot = Array2::zeros((labels.len(), width));
    for (mut row, &label) in one_hot.axis_iter_mut(Axis(0)).zip(labels) {
        row[label as usize] = 1.0;
    }
    Ok(one_hot)
}
