//! wardgate/src/backend/service.rs
//! Per-service model state and the append-only observation logs.

use crate::backend::kmeans;
use crate::model::{self, Point};
use crate::types::Mode;
use crate::wire;
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

/// Upper bound on observations read back per refit.
pub const MAX_CHUNK_SIZE: usize = 2500;

const REVERSE_READ_CHUNK: u64 = 8192;

/// Model state of one service; the mutex keeps `(centroids, blocked,
/// mode)` consistent for readers.
#[derive(Debug, Default)]
pub struct ServiceState {
    pub centroids: Vec<Vec<f64>>,
    pub blocked: Vec<usize>,
    pub mode: Mode,
    pub examples: Vec<String>,
}

/// One protected service known to the backend, with its two append-only
/// logs: `{id}-points.txt` (one 32-float line per observation) and
/// `{id}-convs.txt` (one textual conversation per observation).
pub struct Service {
    id: String,
    points_path: PathBuf,
    convs_path: PathBuf,
    state: Mutex<ServiceState>,
}

impl Service {
    /// Creates the service, touching both log files so they exist from
    /// first reference.
    pub fn new(id: &str, data_dir: &Path) -> io::Result<Service> {
        let points_path = data_dir.join(format!("{id}-points.txt"));
        let convs_path = data_dir.join(format!("{id}-convs.txt"));
        OpenOptions::new()
            .append(true)
            .create(true)
            .open(&points_path)?;
        OpenOptions::new()
            .append(true)
            .create(true)
            .open(&convs_path)?;
        Ok(Service {
            id: id.to_string(),
            points_path,
            convs_path,
            state: Mutex::new(ServiceState::default()),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> MutexGuard<'_, ServiceState> {
        self.state.lock().unwrap()
    }

    /// The `centroids # mode # blocked` reply for an update request,
    /// rendered from the current (pre-update) model.
    pub fn model_reply(&self) -> String {
        let state = self.state();
        wire::encode_model_reply(&state.centroids, state.mode, &state.blocked)
    }

    /// Appends one point line and one conversation line per pushed
    /// connection.
    pub fn append_observations(&self, conversations: &[Vec<Vec<u8>>]) -> io::Result<()> {
        if conversations.is_empty() {
            return Ok(());
        }
        let mut points = BufWriter::new(
            OpenOptions::new()
                .append(true)
                .create(true)
                .open(&self.points_path)?,
        );
        let mut convs = BufWriter::new(
            OpenOptions::new()
                .append(true)
                .create(true)
                .open(&self.convs_path)?,
        );
        for conversation in conversations {
            let point = Point::from_packets(conversation);
            writeln!(points, "{}", wire::fmt_float_list(&point.to_values()))?;
            writeln!(convs, "{}", wire::fmt_conv_line(conversation))?;
        }
        points.flush()?;
        convs.flush()?;
        debug!(
            service = %self.id,
            observations = conversations.len(),
            "persisted observations"
        );
        Ok(())
    }

    /// The most recent observations, newest first, capped at
    /// [`MAX_CHUNK_SIZE`]. Unparseable lines are skipped.
    pub fn recent_points(&self) -> io::Result<Vec<Vec<f64>>> {
        let lines = reverse_lines(&self.points_path, MAX_CHUNK_SIZE)?;
        Ok(lines
            .iter()
            .filter_map(|line| wire::parse_float_list(line).ok())
            .collect())
    }

    /// Refits the service model from its recent observations: silhouette
    /// picks the cluster count, blocked status propagates from each new
    /// centroid's nearest old centroid, and the per-cluster examples are
    /// rebuilt. Nothing changes when there are too few observations.
    pub fn refit(&self) -> io::Result<()> {
        let points = self.recent_points()?;
        if points.is_empty() {
            return Ok(());
        }
        let Some(new_centroids) = kmeans::best_fit(&points) else {
            return Ok(());
        };

        {
            let mut state = self.state();
            let new_blocked =
                propagate_blocked(&new_centroids, &state.centroids, &state.blocked);
            info!(
                service = %self.id,
                clusters = new_centroids.len(),
                blocked = new_blocked.len(),
                "model refitted"
            );
            state.centroids = new_centroids;
            state.blocked = new_blocked;
        }
        self.update_examples(&points)
    }

    /// Records, for each centroid, the most recent conversation whose
    /// point is assigned to it. `points` must be the newest-first rows the
    /// model was just fitted from, so row i matches conversation line i
    /// from the end of the convs file.
    fn update_examples(&self, points: &[Vec<f64>]) -> io::Result<()> {
        let centroids = self.state().centroids.clone();
        let mut missing: Vec<usize> = (0..centroids.len()).collect();
        let mut wanted: VecDeque<(usize, usize)> = VecDeque::new();
        for (row, point) in points.iter().enumerate() {
            if let Some(cluster) = model::assign_values(point, &centroids) {
                if let Some(slot) = missing.iter().position(|&m| m == cluster) {
                    missing.remove(slot);
                    wanted.push_back((row, cluster));
                }
            }
            if missing.is_empty() {
                break;
            }
        }

        let mut examples = vec![String::new(); centroids.len()];
        if !wanted.is_empty() {
            let lines = reverse_lines(&self.convs_path, MAX_CHUNK_SIZE)?;
            for (row, line) in lines.iter().enumerate() {
                let Some(&(wanted_row, cluster)) = wanted.front() else {
                    break;
                };
                if row == wanted_row {
                    examples[cluster] = line.clone();
                    wanted.pop_front();
                }
            }
        }
        self.state().examples = examples;
        Ok(())
    }
}

/// Blocked status is transitive across refits: a new centroid inherits it
/// from its nearest old centroid. A new centroid nearest to a never-blocked
/// old centroid stays unblocked even if most of its points came from a
/// blocked cluster.
pub fn propagate_blocked(
    new_centroids: &[Vec<f64>],
    old_centroids: &[Vec<f64>],
    old_blocked: &[usize],
) -> Vec<usize> {
    let mut blocked = Vec::new();
    for (i, centroid) in new_centroids.iter().enumerate() {
        if let Some(nearest_old) = model::assign_values(centroid, old_centroids) {
            if old_blocked.contains(&nearest_old) {
                blocked.push(i);
            }
        }
    }
    blocked
}

/// Lines of a file newest-first, reading backwards in chunks so only the
/// tail of a large log is touched. Empty lines are skipped.
fn reverse_lines(path: &Path, cap: usize) -> io::Result<Vec<String>> {
    let mut file = File::open(path)?;
    let mut remaining = file.seek(SeekFrom::End(0))?;
    let mut segment: Vec<u8> = Vec::new();
    let mut lines = Vec::new();
    while remaining > 0 && lines.len() < cap {
        let take = REVERSE_READ_CHUNK.min(remaining);
        remaining -= take;
        file.seek(SeekFrom::Start(remaining))?;
        let mut chunk = vec![0u8; take as usize];
        file.read_exact(&mut chunk)?;
        chunk.extend_from_slice(&segment);
        let mut parts: Vec<Vec<u8>> = chunk.split(|&b| b == b'\n').map(<[u8]>::to_vec).collect();
        segment = parts.remove(0);
        for part in parts.iter().rev() {
            if part.is_empty() {
                continue;
            }
            lines.push(String::from_utf8_lossy(part).into_owned());
            if lines.len() >= cap {
                return Ok(lines);
            }
        }
    }
    if !segment.is_empty() && lines.len() < cap {
        lines.push(String::from_utf8_lossy(&segment).into_owned());
    }
    Ok(lines)
}
