//! wardgate/src/backend/control.rs
//! Line-oriented operator surface.
//!
//! Generic over the line source and sink: the backend binary drives it
//! from stdin/stdout, a daemonised deployment can hand it an admin socket
//! instead.

use crate::backend::ServiceRegistry;
use crate::backend::service::Service;
use crate::types::Mode;
use crate::wire;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tracing::debug;

fn render_menu(current: Option<&Service>) -> String {
    let (id, clusters, mode, blocked) = match current {
        Some(service) => {
            let state = service.state();
            (
                service.id().to_string(),
                state.centroids.len(),
                state.mode.to_string(),
                wire::fmt_index_list(&state.blocked),
            )
        }
        None => (String::new(), 0, String::new(), String::new()),
    };
    format!(
        "\nCurrent Service: {id} \t N. Clusters: {clusters} \t Mode: {mode} \t Blocked: {blocked}\n\
         Available Options:\n\n\
         \x20- CHECK_EXAMPLES\n\
         \x20- SET_MODE [ACTIVE_MODE/SIMULATION_MODE]\n\
         \x20- SET_BLOCKED <list>\n\
         \x20- SET_SERVICE <port>\n\
         \x20- SHUT_DOWN\n\n> "
    )
}

/// Interprets operator commands until the channel closes or SHUT_DOWN is
/// issued (which also signals the backend through `shutdown`).
pub async fn run_control<R, W>(
    registry: Arc<ServiceRegistry>,
    mut input: R,
    mut output: W,
    shutdown: watch::Sender<bool>,
) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut current: Option<Arc<Service>> = None;
    loop {
        output
            .write_all(render_menu(current.as_deref()).as_bytes())
            .await?;
        output.flush().await?;

        let mut line = String::new();
        if input.read_line(&mut line).await? == 0 {
            debug!("control channel closed");
            return Ok(());
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (command, rest) = match line.split_once(' ') {
            Some((command, rest)) => (command, rest.trim()),
            None => (line, ""),
        };

        if command == "SET_SERVICE" {
            if rest.is_empty() {
                output.write_all(b"Unknown command\n").await?;
                continue;
            }
            match registry.get_or_create(rest) {
                Ok(service) => current = Some(service),
                Err(e) => {
                    output
                        .write_all(format!("Could not open service files: {e}\n").as_bytes())
                        .await?;
                }
            }
            continue;
        }
        let Some(service) = current.clone() else {
            output.write_all(b"Please set a service first\n").await?;
            continue;
        };

        match command {
            "SET_MODE" => match rest.parse::<Mode>() {
                Ok(mode) => service.state().mode = mode,
                Err(()) => output.write_all(b"Unknown mode\n").await?,
            },
            "SET_BLOCKED" => match wire::parse_index_list(rest) {
                Ok(blocked) => service.state().blocked = blocked,
                Err(_) => output.write_all(b"Could not parse blocked list\n").await?,
            },
            "CHECK_EXAMPLES" => {
                let (examples, blocked) = {
                    let state = service.state();
                    (state.examples.clone(), state.blocked.clone())
                };
                let mut listing = String::from("\n");
                for (i, example) in examples.iter().enumerate() {
                    let tag = if blocked.contains(&i) {
                        "[BLOCKED]"
                    } else {
                        "[ALLOWED]"
                    };
                    listing.push_str(&format!("{tag} {example}\n"));
                }
                output.write_all(listing.as_bytes()).await?;
            }
            "SHUT_DOWN" => {
                let _ = shutdown.send(true);
                output.write_all(b"Shutting down\n").await?;
                return Ok(());
            }
            _ => output.write_all(b"Unknown command\n").await?,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio::io::BufReader;

    static DIR_COUNTER: AtomicU64 = AtomicU64::new(0);

    fn temp_registry() -> Arc<ServiceRegistry> {
        let dir: PathBuf = std::env::temp_dir().join(format!(
            "wardgate-control-test-{}-{}",
            std::process::id(),
            DIR_COUNTER.fetch_add(1, Ordering::SeqCst)
        ));
        std::fs::create_dir_all(&dir).unwrap();
        ServiceRegistry::new(dir)
    }

    async fn run_commands(registry: Arc<ServiceRegistry>, commands: &str) -> (String, bool) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut output: Vec<u8> = Vec::new();
        run_control(
            registry,
            BufReader::new(commands.as_bytes()),
            &mut output,
            shutdown_tx,
        )
        .await
        .unwrap();
        (String::from_utf8(output).unwrap(), *shutdown_rx.borrow())
    }

    #[tokio::test]
    async fn commands_need_a_service_selection_first() {
        let registry = temp_registry();
        let (output, shut) = run_commands(registry, "SET_MODE ACTIVE_MODE\nSHUT_DOWN\n").await;
        assert!(output.contains("Please set a service first"));
        assert!(!shut);
    }

    #[tokio::test]
    async fn set_service_creates_and_selects() {
        let registry = temp_registry();
        let (output, _) = run_commands(
            registry.clone(),
            "SET_SERVICE 1234\nSET_MODE ACTIVE_MODE\nSET_BLOCKED [0, 2]\n",
        )
        .await;
        assert!(output.contains("Current Service: 1234"));

        let service = registry.get("1234").unwrap();
        let state = service.state();
        assert_eq!(state.mode, Mode::Active);
        assert_eq!(state.blocked, vec![0, 2]);
    }

    #[tokio::test]
    async fn blocked_list_is_set_verbatim() {
        let registry = temp_registry();
        run_commands(registry.clone(), "SET_SERVICE 9\nSET_BLOCKED [5]\n").await;
        // No transitivity and no bounds check at the surface; the next
        // refit owns reconciliation.
        assert_eq!(registry.get("9").unwrap().state().blocked, vec![5]);
    }

    #[tokio::test]
    async fn check_examples_tags_blocked_clusters() {
        let registry = temp_registry();
        let service = registry.get_or_create("7").unwrap();
        {
            let mut state = service.state();
            state.examples = vec!["['clean']".to_string(), "['evil']".to_string()];
            state.blocked = vec![1];
        }
        let (output, _) = run_commands(registry, "SET_SERVICE 7\nCHECK_EXAMPLES\n").await;
        assert!(output.contains("[ALLOWED] ['clean']"));
        assert!(output.contains("[BLOCKED] ['evil']"));
    }

    #[tokio::test]
    async fn unknown_commands_and_modes_are_reported() {
        let registry = temp_registry();
        let (output, _) = run_commands(
            registry,
            "SET_SERVICE 1\nFROBNICATE\nSET_MODE LOUD_MODE\n",
        )
        .await;
        assert!(output.contains("Unknown command"));
        assert!(output.contains("Unknown mode"));
    }

    #[tokio::test]
    async fn shut_down_signals_the_backend() {
        let registry = temp_registry();
        let (output, shut) = run_commands(registry, "SET_SERVICE 1\nSHUT_DOWN\n").await;
        assert!(output.contains("Shutting down"));
        assert!(shut);
    }
}
