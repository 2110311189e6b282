use std::fs::OpenOptions;
use std::mem::{align_of, size_of};
use std::path::{Path, PathBuf};

use memmap2::MmapMut;

use crate::channel::PoseChannel;

/// Default location of the shared pose record.
pub const DEFAULT_SHM_PATH: &str = "/dev/shm/vruco_pose";

// `#[repr(C)]`: the flag follows the seven 32-bit pose fields
const FLAG_OFFSET: usize = 7 * size_of::<u32>();

/// Error raised while mapping the shared pose record.
#[derive(Debug, thiserror::Error)]
pub enum ShmError {
    /// Opening, resizing or mapping the backing file failed.
    #[error("Failed to map shared pose record {path}. {source}")]
    Map {
        /// Backing file
        path: PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },
}

/// A [`PoseChannel`] living in a memory-mapped file shared with the consumer process.
pub struct SharedPoseRegion {
    path: PathBuf,
    mmap: MmapMut,
}

impl SharedPoseRegion {
    /// Create or open `path` and map one pose record from its start.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ShmError> {
        let path = path.as_ref().to_path_buf();
        let map_err = |source| ShmError::Map {
            path: path.clone(),
            source,
        };

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(map_err)?;
        let len = size_of::<PoseChannel>() as u64;
        if file.metadata().map_err(map_err)?.len() < len {
            file.set_len(len).map_err(map_err)?;
        }

        // SAFETY: the file stays open for the lifetime of the mapping and is at
        // least one record long.
        let mut mmap = unsafe { MmapMut::map_mut(&file) }.map_err(map_err)?;

        // any byte other than 0/1 is not a valid bool
        if mmap[FLAG_OFFSET] > 1 {
            mmap[FLAG_OFFSET] = 0;
        }
        debug_assert_eq!(mmap.as_ptr() as usize % align_of::<PoseChannel>(), 0);

        log::info!("mapped shared pose record at {}", path.display());
        Ok(Self { path, mmap })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The shared record.
    pub fn channel(&self) -> &PoseChannel {
        // SAFETY: the mapping is page aligned, at least `size_of::<PoseChannel>()`
        // bytes, and holds a valid bit pattern (all fields are plain atomics and
        // the flag byte was sanitized on open). Every access goes through atomics.
        unsafe { &*(self.mmap.as_ptr() as *const PoseChannel) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Pose;

    #[test]
    fn test_two_mappings_share_the_record() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("pose");

        let producer = SharedPoseRegion::open(&path)?;
        let consumer = SharedPoseRegion::open(&path)?;

        let pose = Pose {
            position: [0.5, 1.75, -0.25],
            orientation: [0.0, 0.0, 0.0, 1.0],
        };
        assert!(producer.channel().publish(&pose));
        assert!(!producer.channel().publish(&pose));
        assert_eq!(consumer.channel().try_consume(), Some(pose));
        assert!(producer.channel().publish(&pose));

        let size = std::fs::metadata(&path)?.len();
        assert_eq!(size, size_of::<PoseChannel>() as u64);
        Ok(())
    }

    #[test]
    fn test_garbage_flag_is_cleared() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("pose");
        std::fs::write(&path, vec![0xAB; size_of::<PoseChannel>()])?;
        let region = SharedPoseRegion::open(&path)?;
        assert!(!region.channel().is_ready());
        Ok(())
    }
}
