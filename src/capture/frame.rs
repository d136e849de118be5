use serde::{Deserialize, Serialize};

/// Pixel formats a capture device may deliver
///
/// Frame slots always hold packed RGB24; other formats are converted on the
/// capture thread before publishing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Rgb24,
    Bgr24,
    Yuyv4,
    Mjpeg,
}

/// Geometry of every slot in one camera stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameFormat {
    pub width: u32,
    pub height: u32,
    pub channels: u32,
}

impl FrameFormat {
    pub const fn rgb(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            channels: 3,
        }
    }

    /// Bytes in one complete frame.
    pub const fn frame_len(&self) -> usize {
        self.width as usize * self.height as usize * self.channels as usize
    }

    pub const fn row_len(&self) -> usize {
        self.width as usize * self.channels as usize
    }
}

/// Which camera of the stereo pair a stream belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Eye {
    Left,
    Right,
}

impl Eye {
    pub const BOTH: [Eye; 2] = [Eye::Left, Eye::Right];

    pub const fn index(self) -> usize {
        match self {
            Eye::Left => 0,
            Eye::Right => 1,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Eye::Left => "left",
            Eye::Right => "right",
        }
    }
}

/// Newest frame identifier per stream; 0 means the stream has produced nothing yet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct StereoIds {
    pub left: u64,
    pub right: u64,
}

impl StereoIds {
    pub const fn new(left: u64, right: u64) -> Self {
        Self { left, right }
    }

    pub const fn get(&self, eye: Eye) -> u64 {
        match eye {
            Eye::Left => self.left,
            Eye::Right => self.right,
        }
    }

    pub fn set(&mut self, eye: Eye, id: u64) {
        match eye {
            Eye::Left => self.left = id,
            Eye::Right => self.right = id,
        }
    }

    /// Both streams have published at least once.
    pub const fn is_ready(&self) -> bool {
        self.left != 0 && self.right != 0
    }

    /// True if either stream moved past `other`.
    pub const fn advanced_since(&self, other: &StereoIds) -> bool {
        self.left > other.left || self.right > other.right
    }

    /// Per-stream maximum of `self` and `other`.
    pub fn newest(self, other: StereoIds) -> StereoIds {
        Self::new(self.left.max(other.left), self.right.max(other.right))
    }

    /// Per-stream minimum of `self` and `other`.
    pub fn oldest(self, other: StereoIds) -> StereoIds {
        Self::new(self.left.min(other.left), self.right.min(other.right))
    }

    /// Number of identifiers between `older` and `self`, summed over both streams.
    pub fn distance_from(&self, older: &StereoIds) -> u64 {
        self.left.saturating_sub(older.left) + self.right.saturating_sub(older.right)
    }
}
