mod async_image;

pub use async_image::{AsyncLoader, ImageDisplay, ImageLoadedEvent};
