//! 복제 재시작 위치(GTID 집합) 저장소
//!
//! `<data_dir>/.master.info` 파일에 마지막으로 확정된 GTID 집합을 기록합니다.
//! 디스크 쓰기는 저장 간격(기본 1초)당 최대 한 번이며,
//! 메모리 값은 항상 마지막 `save` 호출을 반영합니다.
//! 쓰기는 임시 파일 + rename으로 원자적으로 교체합니다.

use crate::error::{CdcError, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, error};

pub const POSITION_FILE_NAME: &str = ".master.info";
pub const DEFAULT_SAVE_INTERVAL: Duration = Duration::from_secs(1);

/// 디스크에 기록되는 형식
#[derive(Debug, Default, Serialize, Deserialize)]
struct PositionFile {
    #[serde(default)]
    gtid_set: String,
}

/// 복제 재시작 위치
#[derive(Debug, Clone, Default)]
pub struct ReplicationPosition {
    pub gtid_set: String,
    pub file_path: Option<PathBuf>,
    /// 마지막 디스크 쓰기 시각
    pub last_save_time: Option<Instant>,
}

/// 스레드 안전한 위치 저장소
#[derive(Debug)]
pub struct PositionStore {
    inner: RwLock<ReplicationPosition>,
    save_interval: Duration,
}

impl PositionStore {
    /// 디렉터리에서 위치 로드
    ///
    /// 파일이 없으면 빈 GTID 집합으로 시작합니다.
    /// 파일이 있는데 파싱할 수 없으면 에러입니다.
    pub fn load(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).map_err(|e| {
            CdcError::PositionLoad(format!("failed to create {}: {}", dir.display(), e))
        })?;

        let file_path = dir.join(POSITION_FILE_NAME);
        let gtid_set = match fs::read_to_string(&file_path) {
            Ok(contents) => {
                let decoded: PositionFile = toml::from_str(&contents).map_err(|e| {
                    CdcError::PositionLoad(format!("corrupt {}: {}", file_path.display(), e))
                })?;
                decoded.gtid_set
            }
            Err(e) if e.kind() == ErrorKind::NotFound => String::new(),
            Err(e) => {
                return Err(CdcError::PositionLoad(format!(
                    "failed to read {}: {}",
                    file_path.display(),
                    e
                )))
            }
        };

        debug!("Loaded replication position from {}: {:?}", file_path.display(), gtid_set);

        Ok(Self::from_position(ReplicationPosition {
            gtid_set,
            file_path: Some(file_path),
            last_save_time: None,
        }))
    }

    /// 파일 없이 메모리에만 유지하는 저장소
    pub fn in_memory() -> Self {
        Self::from_position(ReplicationPosition::default())
    }

    fn from_position(position: ReplicationPosition) -> Self {
        PositionStore {
            inner: RwLock::new(position),
            save_interval: DEFAULT_SAVE_INTERVAL,
        }
    }

    pub fn with_save_interval(mut self, interval: Duration) -> Self {
        self.save_interval = interval;
        self
    }

    /// 위치 저장 (간격 제한 적용)
    pub fn save(&self, gtid_set: &str) -> Result<()> {
        let mut pos = self.inner.write();
        pos.gtid_set = gtid_set.to_string();

        if let Some(last) = pos.last_save_time {
            if last.elapsed() < self.save_interval {
                return Ok(());
            }
        }

        Self::persist(&mut pos)
    }

    /// 현재 메모리상의 GTID 집합
    pub fn current(&self) -> String {
        self.inner.read().gtid_set.clone()
    }

    pub fn position(&self) -> ReplicationPosition {
        self.inner.read().clone()
    }

    /// 간격 제한 없이 현재 값을 강제로 기록
    pub fn close(&self) -> Result<()> {
        let mut pos = self.inner.write();
        Self::persist(&mut pos)
    }

    fn persist(pos: &mut ReplicationPosition) -> Result<()> {
        let Some(path) = pos.file_path.clone() else {
            return Ok(());
        };

        let encoded = toml::to_string(&PositionFile {
            gtid_set: pos.gtid_set.clone(),
        })
        .map_err(|e| CdcError::PositionSave(e.to_string()))?;

        if let Err(e) = write_file_atomic(&path, encoded.as_bytes()) {
            error!("Failed to save replication position to {}: {}", path.display(), e);
            return Err(CdcError::PositionSave(format!("{}: {}", path.display(), e)));
        }

        pos.last_save_time = Some(Instant::now());
        debug!("Saved replication position: {}", pos.gtid_set);
        Ok(())
    }
}

/// 임시 파일에 쓰고 fsync 후 rename
fn write_file_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    let result = (|| {
        let mut file = File::create(&tmp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
        fs::rename(&tmp_path, path)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const GTID_A: &str = "3e11fa47-71ca-11e1-9e33-c80aa9429562:1-5";
    const GTID_B: &str = "3e11fa47-71ca-11e1-9e33-c80aa9429562:1-9";

    fn on_disk(dir: &Path) -> String {
        PositionStore::load(dir).unwrap().current()
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let data_dir = dir.path().join("nested").join("state");

        let store = PositionStore::load(&data_dir).unwrap();
        assert_eq!(store.current(), "");
        assert!(data_dir.is_dir());
        assert!(!data_dir.join(POSITION_FILE_NAME).exists());
    }

    #[test]
    fn test_load_corrupt_file_fails() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(POSITION_FILE_NAME), "gtid_set = [broken").unwrap();

        let err = PositionStore::load(dir.path()).unwrap_err();
        assert!(matches!(err, CdcError::PositionLoad(_)));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempdir().unwrap();
        let store = PositionStore::load(dir.path()).unwrap();
        tokio_test::assert_ok!(store.save(GTID_A));

        assert_eq!(on_disk(dir.path()), GTID_A);
        let contents = fs::read_to_string(dir.path().join(POSITION_FILE_NAME)).unwrap();
        assert!(contents.contains("gtid_set"));
    }

    #[test]
    fn test_save_is_throttled_but_memory_is_current() {
        let dir = tempdir().unwrap();
        let store = PositionStore::load(dir.path()).unwrap();

        store.save(GTID_A).unwrap();
        store.save(GTID_B).unwrap();

        assert_eq!(store.current(), GTID_B);
        assert_eq!(on_disk(dir.path()), GTID_A);
    }

    #[test]
    fn test_save_after_interval_persists() {
        let dir = tempdir().unwrap();
        let store = PositionStore::load(dir.path())
            .unwrap()
            .with_save_interval(Duration::from_millis(20));

        store.save(GTID_A).unwrap();
        std::thread::sleep(Duration::from_millis(40));
        store.save(GTID_B).unwrap();

        assert_eq!(on_disk(dir.path()), GTID_B);
    }

    #[test]
    fn test_close_bypasses_throttle() {
        let dir = tempdir().unwrap();
        let store = PositionStore::load(dir.path()).unwrap();

        store.save(GTID_A).unwrap();
        store.save(GTID_B).unwrap();
        store.close().unwrap();

        assert_eq!(on_disk(dir.path()), GTID_B);
    }

    #[test]
    fn test_interrupted_write_keeps_previous_value() {
        let dir = tempdir().unwrap();
        let store = PositionStore::load(dir.path()).unwrap();
        store.save(GTID_A).unwrap();

        // rename 전에 중단된 쓰기: 잘린 임시 파일만 남음
        fs::write(dir.path().join(".master.info.tmp"), "gtid_set = \"3e11fa47").unwrap();

        assert_eq!(on_disk(dir.path()), GTID_A);
    }

    #[test]
    fn test_in_memory_store() {
        let store = PositionStore::in_memory();
        store.save(GTID_A).unwrap();
        store.close().unwrap();
        assert_eq!(store.current(), GTID_A);
        assert!(store.position().file_path.is_none());
    }
}
