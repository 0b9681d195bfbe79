use thiserror::Error;

#[derive(Debug, Error)]
pub enum MotionError {
    #[error("frame buffer holds {actual} bytes, expected {expected} for {width}x{height} BGR")]
    BufferSize {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
    #[error("downscale factor {factor} leaves no pixels from {width}x{height}")]
    Downscale { factor: u32, width: u32, height: u32 },
    #[error("expected an 8-bit single-channel {cols}x{rows} image, got OpenCV type {mat_type}")]
    Layout { mat_type: i32, cols: i32, rows: i32 },
    #[error(transparent)]
    OpenCv(#[from] opencv::Error),
}

pub type Result<T, E = MotionError> = std::result::Result<T, E>;
