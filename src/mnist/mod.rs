// This module contains all the MNIST-specific code in the project

mod load_mnist;
pub use load_mnist::{dataset_path, load_mnist, Split, DATASET_FILE, DATA_PATH_VAR};

mod preprocess;
pub use preprocess::{add_channel_axis, normalize, prepare_images, to_categorical, PIXEL_SCALE};
