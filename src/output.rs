//! Snapshot series and final-state writers.

use crate::error::EngineError;
use log::{info, warn};
use multicell_common::{AgentRecord, Snapshot};
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotFormat {
    Json,
    Bincode,
    MessagePack,
}

impl SnapshotFormat {
    /// Unknown names fall back to JSON.
    pub fn from_name(name: Option<&str>) -> Self {
        match name.unwrap_or("json") {
            "json" => SnapshotFormat::Json,
            "bincode" => SnapshotFormat::Bincode,
            "messagepack" | "msgpack" => SnapshotFormat::MessagePack,
            other => {
                warn!("Unknown output format: {}. Using JSON instead.", other);
                SnapshotFormat::Json
            }
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            SnapshotFormat::Json => "json",
            SnapshotFormat::Bincode => "bin",
            SnapshotFormat::MessagePack => "msgpack",
        }
    }
}

fn create(path: &Path) -> Result<BufWriter<File>, EngineError> {
    File::create(path)
        .map(BufWriter::new)
        .map_err(|e| EngineError::fatal_io(path, e))
}

fn serialize_error(path: &Path, e: impl std::fmt::Display) -> EngineError {
    EngineError::Serialize { path: path.to_path_buf(), message: e.to_string() }
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), EngineError> {
    let mut writer = create(path)?;
    serde_json::to_writer(&mut writer, value).map_err(|e| serialize_error(path, e))?;
    writer.flush().map_err(|e| EngineError::fatal_io(path, e))
}

/// Writes every recorded snapshot to `<base_filename>_snapshots.<ext>`.
pub fn write_snapshots(
    snapshots: &[Snapshot],
    base_filename: &str,
    format: SnapshotFormat,
) -> Result<PathBuf, EngineError> {
    let path = PathBuf::from(format!("{}_snapshots.{}", base_filename, format.extension()));
    match format {
        SnapshotFormat::Json => write_json(&path, snapshots)?,
        SnapshotFormat::Bincode => {
            let mut writer = create(&path)?;
            bincode::serialize_into(&mut writer, snapshots).map_err(|e| serialize_error(&path, e))?;
            writer.flush().map_err(|e| EngineError::fatal_io(&path, e))?;
        }
        SnapshotFormat::MessagePack => {
            let mut writer = create(&path)?;
            rmp_serde::encode::write(&mut writer, snapshots).map_err(|e| serialize_error(&path, e))?;
            writer.flush().map_err(|e| EngineError::fatal_io(&path, e))?;
        }
    }
    info!("{} snapshots saved to {}", snapshots.len(), path.display());
    Ok(path)
}

/// Writes one row per agent to `<base_filename>_final_state.csv`.
pub fn write_final_state(records: &[AgentRecord], base_filename: &str) -> Result<PathBuf, EngineError> {
    let path = PathBuf::from(format!("{}_final_state.csv", base_filename));
    let mut writer = csv::Writer::from_path(&path).map_err(|e| match e.into_kind() {
        csv::ErrorKind::Io(io) => EngineError::fatal_io(&path, io),
        other => serialize_error(&path, format!("{:?}", other)),
    })?;
    for record in records {
        writer.serialize(record).map_err(|e| serialize_error(&path, e))?;
    }
    writer.flush().map_err(|e| EngineError::fatal_io(&path, e))?;
    info!("Final state of {} agents saved to {}", records.len(), path.display());
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(time: f64) -> Snapshot {
        Snapshot {
            time,
            total_agents: 2,
            alive: 1,
            dying: 1,
            dead: 0,
            counts_by_type: vec![("tumor".into(), 2)],
            attached_pairs: 0,
            substrates: Vec::new(),
            agents: None,
        }
    }

    fn record(id: u64) -> AgentRecord {
        AgentRecord {
            id,
            type_name: "tumor".into(),
            x: 1.0,
            y: 2.0,
            z: 0.0,
            radius: 8.4,
            total_volume: 2494.0,
            state: "alive".into(),
            damage: 0.0,
            attached: 0,
        }
    }

    #[test]
    fn unknown_format_falls_back_to_json() {
        assert_eq!(SnapshotFormat::from_name(None), SnapshotFormat::Json);
        assert_eq!(SnapshotFormat::from_name(Some("bincode")), SnapshotFormat::Bincode);
        assert_eq!(SnapshotFormat::from_name(Some("msgpack")), SnapshotFormat::MessagePack);
        assert_eq!(SnapshotFormat::from_name(Some("xml")), SnapshotFormat::Json);
    }

    #[test]
    fn snapshots_read_back_in_every_format() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("run");
        let base = base.to_str().unwrap();
        let mut with_agents = snapshot(6.0);
        with_agents.agents = Some(vec![record(0), record(1)]);
        let snapshots = vec![snapshot(0.0), with_agents, snapshot(12.0)];

        let path = write_snapshots(&snapshots, base, SnapshotFormat::Json).unwrap();
        let back: Vec<Snapshot> = serde_json::from_reader(File::open(path).unwrap()).unwrap();
        assert_eq!(back, snapshots);

        let path = write_snapshots(&snapshots, base, SnapshotFormat::Bincode).unwrap();
        let back: Vec<Snapshot> = bincode::deserialize_from(File::open(path).unwrap()).unwrap();
        assert_eq!(back, snapshots);

        let path = write_snapshots(&snapshots, base, SnapshotFormat::MessagePack).unwrap();
        let back: Vec<Snapshot> = rmp_serde::from_read(File::open(path).unwrap()).unwrap();
        assert_eq!(back, snapshots);
    }

    #[test]
    fn final_state_has_header_and_one_row_per_agent() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("run");
        let path = write_final_state(&[record(0), record(7)], base.to_str().unwrap()).unwrap();
        let text = std::fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("id,type_name,x,y,z"));
        assert!(lines[2].starts_with("7,tumor,"));
    }

    #[test]
    fn missing_directory_is_fatal_io() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("no_such_dir").join("run");
        let err = write_snapshots(&[], base.to_str().unwrap(), SnapshotFormat::Json).unwrap_err();
        assert_eq!(err.exit_code(), 74);
    }
}
