//! wardgate/src/judge.rs
//! Proxy-side learning client: model snapshot, kill/allow verdicts, and
//! the periodic update exchange with the backend.

use crate::error::ProxyError;
use crate::model::{self, Point};
use crate::types::{JudgeConfig, Mode};
use crate::wire;
use std::sync::{Arc, Mutex, RwLock};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, info};

/// Immutable model bundle. The update loop installs a fresh one; every
/// verdict reads a cheap snapshot reference, so no lock spans the
/// nearest-centroid search.
#[derive(Debug)]
pub struct ModelSnapshot {
    pub centroids: Vec<Point>,
    pub blocked: Vec<usize>,
    pub simulation: bool,
}

impl Default for ModelSnapshot {
    fn default() -> Self {
        // Until the backend says otherwise the judge only observes.
        ModelSnapshot {
            centroids: Vec::new(),
            blocked: Vec::new(),
            simulation: true,
        }
    }
}

/// Process-scoped learning client shared by all connections of one proxy.
pub struct Judge {
    config: JudgeConfig,
    flag_regex: regex::bytes::Regex,
    model: RwLock<Arc<ModelSnapshot>>,
    dataset: Mutex<Vec<Vec<Vec<u8>>>>,
}

impl Judge {
    pub fn new(config: JudgeConfig) -> Result<Arc<Judge>, ProxyError> {
        let flag_regex = regex::bytes::Regex::new(&config.flag_regex)?;
        Ok(Arc::new(Judge {
            config,
            flag_regex,
            model: RwLock::new(Arc::new(ModelSnapshot::default())),
            dataset: Mutex::new(Vec::new()),
        }))
    }

    /// Whether a packet carries a flag-shaped token.
    pub fn sees_flag(&self, packet: &[u8]) -> bool {
        self.flag_regex.is_match(packet)
    }

    pub fn snapshot(&self) -> Arc<ModelSnapshot> {
        self.model.read().unwrap().clone()
    }

    /// Records the conversation and judges it: `false` means the
    /// connection must be killed. Simulation mode always allows but still
    /// records, so the backend keeps learning.
    pub fn verdict(&self, packets: Vec<Vec<u8>>) -> bool {
        let snapshot = self.snapshot();
        let point = Point::from_packets(&packets);
        self.dataset.lock().unwrap().push(packets);

        if snapshot.simulation {
            return true;
        }
        match model::assign(&point, &snapshot.centroids) {
            Some(index) if snapshot.blocked.contains(&index) => {
                info!("blocking an attack");
                false
            }
            _ => true,
        }
    }

    /// Runs forever: every update interval, push the accumulated dataset
    /// and refresh the model. A failed round only costs the pushed
    /// observations; the loop itself never dies.
    pub async fn run_updater(self: Arc<Self>, service_id: String) {
        loop {
            tokio::time::sleep(self.config.update_interval()).await;
            if let Err(e) = self.exchange(&service_id).await {
                info!(service = %service_id, "update round skipped: {}", e);
            }
        }
    }

    /// One update exchange. The dataset is drained once the connection is
    /// up and not restored on failure: observations are never re-sent.
    pub async fn exchange(&self, service_id: &str) -> Result<(), ProxyError> {
        let mut stream = TcpStream::connect((
            self.config.updater_address.as_str(),
            self.config.updater_port,
        ))
        .await?;
        info!(
            service = %service_id,
            endpoint = %format!("{}:{}", self.config.updater_address, self.config.updater_port),
            "sending update request"
        );

        let dataset = std::mem::take(&mut *self.dataset.lock().unwrap());
        let request = wire::encode_update(service_id, &dataset);

        let (mut read_half, mut write_half) = stream.split();
        write_half.write_all(request.as_bytes()).await?;
        write_half.shutdown().await?;

        let reply = wire::read_framed(&mut read_half, self.config.exchange_timeout()).await?;
        match wire::parse_model_reply(&reply)? {
            None => info!(service = %service_id, "received empty model reply"),
            Some(reply) => self.install(reply),
        }
        Ok(())
    }

    fn install(&self, reply: wire::ModelReply) {
        let centroids: Vec<Point> = reply
            .centroids
            .iter()
            .map(|coords| Point::from_values(coords))
            .collect();
        debug!(
            centroids = centroids.len(),
            blocked = reply.blocked.len(),
            mode = %reply.mode,
            "installing model"
        );
        let snapshot = ModelSnapshot {
            centroids,
            blocked: reply.blocked,
            simulation: reply.mode != Mode::Active,
        };
        *self.model.write().unwrap() = Arc::new(snapshot);
    }

    #[cfg(test)]
    pub fn dataset_len(&self) -> usize {
        self.dataset.lock().unwrap().len()
    }

    #[cfg(test)]
    pub fn install_for_tests(&self, reply: wire::ModelReply) {
        self.install(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn test_judge(port: u16) -> Arc<Judge> {
        Judge::new(JudgeConfig::for_endpoint("127.0.0.1", port)).unwrap()
    }

    #[test]
    fn starts_in_simulation_with_no_model() {
        let judge = test_judge(1);
        let snapshot = judge.snapshot();
        assert!(snapshot.simulation);
        assert!(snapshot.centroids.is_empty());
    }

    #[test]
    fn default_flag_regex_shape() {
        let judge = test_judge(1);
        assert!(judge.sees_flag(b"noise ABCDEFGHIJKLMNOPQRSTUVWXYZ01234= noise"));
        assert!(!judge.sees_flag(b"TOOSHORT="));
        assert!(!judge.sees_flag(b"abcdefghijklmnopqrstuvwxyz01234="));
    }

    #[test]
    fn bad_flag_pattern_is_rejected() {
        let mut config = JudgeConfig::for_endpoint("127.0.0.1", 1);
        config.flag_regex = "[unclosed".to_string();
        assert!(matches!(
            Judge::new(config),
            Err(ProxyError::BadFlagPattern(_))
        ));
    }

    #[test]
    fn simulation_allows_but_records() {
        let judge = test_judge(1);
        assert!(judge.verdict(vec![b"anything".to_vec()]));
        assert_eq!(judge.dataset_len(), 1);
    }

    #[test]
    fn active_mode_kills_blocked_cluster() {
        let judge = test_judge(1);
        let attack = vec![vec![0xff; 40], vec![0xfe; 40]];
        let attack_point = Point::from_packets(&attack);
        let benign_point = Point::from_packets(&[b"hello there".to_vec()]);

        judge.install(wire::ModelReply {
            centroids: vec![attack_point.to_values(), benign_point.to_values()],
            mode: Mode::Active,
            blocked: vec![0],
        });

        assert!(!judge.verdict(attack.clone()));
        assert!(judge.verdict(vec![b"hello there".to_vec()]));
        // Judged conversations are recorded either way.
        assert_eq!(judge.dataset_len(), 2);
    }

    #[test]
    fn simulation_reply_disarms_enforcement() {
        let judge = test_judge(1);
        let attack = vec![vec![0xff; 40]];
        let attack_point = Point::from_packets(&attack);
        judge.install(wire::ModelReply {
            centroids: vec![attack_point.to_values()],
            mode: Mode::Simulation,
            blocked: vec![0],
        });
        assert!(judge.verdict(attack));
    }

    #[tokio::test]
    async fn exchange_pushes_dataset_and_installs_reply() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let backend = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = String::new();
            socket.read_to_string(&mut request).await.unwrap();
            let reply = wire::encode_model_reply(&[vec![0.5; 32]], Mode::Active, &[0]);
            socket.write_all(reply.as_bytes()).await.unwrap();
            request
        });

        let judge = test_judge(port);
        judge.verdict(vec![b"one".to_vec()]);
        judge.exchange("4242").await.unwrap();

        let request = backend.await.unwrap();
        assert!(request.starts_with("UPDATE # 4242 # [["));
        assert_eq!(judge.dataset_len(), 0);

        let snapshot = judge.snapshot();
        assert!(!snapshot.simulation);
        assert_eq!(snapshot.centroids.len(), 1);
        assert_eq!(snapshot.blocked, vec![0]);
    }

    #[tokio::test]
    async fn bootstrap_reply_keeps_state_but_clears_dataset() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = String::new();
            socket.read_to_string(&mut request).await.unwrap();
            socket
                .write_all(b"[] # SIMULATION_MODE # []")
                .await
                .unwrap();
        });

        let judge = test_judge(port);
        judge.verdict(vec![b"observed".to_vec()]);
        judge.exchange("1234").await.unwrap();
        assert_eq!(judge.dataset_len(), 0);
        assert!(judge.snapshot().simulation);
        assert!(judge.snapshot().centroids.is_empty());
    }
}
