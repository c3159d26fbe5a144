//! Node driver: wires the relay client, the peer manager and the transfer
//! service into one running process.
//!
//! There is no interactive UI; the driver logs every Transfer status
//! change, answers inbound requests according to `--auto-accept`, and
//! starts the `--send` transfer once every target is online.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{error, info, warn};

use crate::core::checkpoint::CheckpointStore;
use crate::core::connection::PeerManager;
use crate::core::protocol::FileTransferRequest;
use crate::core::registry::{Transfer, TransferStatus};
use crate::core::service::{ServiceOptions, TransferService};
use crate::utils::data_dir;
use crate::utils::sos::SignalOfStop;
use crate::workers::args::Args;
use crate::workers::relay::RelayClient;

pub async fn run(args: Args, sos: SignalOfStop) -> Result<()> {
    let device_id = args.device_id();
    let data_dir = data_dir::get();
    let download_dir = args
        .download_dir
        .clone()
        .unwrap_or_else(|| data_dir.join("downloads"));
    tokio::fs::create_dir_all(&download_dir)
        .await
        .with_context(|| format!("creating {}", download_dir.display()))?;

    let checkpoints = CheckpointStore::open(data_dir.join("checkpoints.json"))
        .await
        .context("opening checkpoint store")?;

    let (signal_out_tx, signal_out_rx) = mpsc::unbounded_channel();
    let (signal_in_tx, mut signal_in_rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    let manager = PeerManager::new(signal_out_tx, events_tx, sos.clone())?;
    let service = TransferService::new(
        ServiceOptions {
            local_id: device_id.clone(),
            policy: args.policy.clone(),
            download_dir: download_dir.clone(),
        },
        Arc::new(manager.clone()),
        Arc::new(checkpoints),
    );
    let relay = RelayClient::new(&args.relay, &device_id, signal_out_rx, signal_in_tx, sos.clone())?;
    let clients = relay.clients();

    info!(
        event = "node_started",
        device_id = %device_id,
        relay = %args.relay,
        downloads = %download_dir.display(),
        "PeerDrop node running"
    );

    let relay_task = {
        let sos = sos.clone();
        tokio::spawn(async move {
            if let Err(e) = relay.run().await {
                error!(event = "relay_failed", error = %e, "Signaling relay lost; shutting down");
                sos.cancel();
            }
        })
    };
    {
        let manager = manager.clone();
        tokio::spawn(async move { manager.supervise().await });
    }
    {
        let manager = manager.clone();
        tokio::spawn(async move {
            while let Some(env) = signal_in_rx.recv().await {
                manager.handle_signal(env).await;
            }
        });
    }
    {
        let service = service.clone();
        let sos = sos.clone();
        tokio::spawn(async move { service.run(events_rx, sos).await });
    }
    tokio::spawn(log_transfers(service.subscribe_transfers(), sos.clone()));
    tokio::spawn(answer_requests(
        service.clone(),
        service.subscribe_requests(),
        args.auto_accept,
        sos.clone(),
    ));

    if let Some(path) = args.send.clone() {
        let service = service.clone();
        let targets = args.to.clone();
        let sos = sos.clone();
        tokio::spawn(async move {
            send_when_online(service, path, targets, clients, sos).await;
        });
    }

    sos.wait().await;
    info!(event = "node_stopping", "Shutting down");
    manager.close_all().await;
    let _ = relay_task.await;
    Ok(())
}

/// Log status transitions of every Transfer.
async fn log_transfers(mut rx: watch::Receiver<Vec<Transfer>>, sos: SignalOfStop) {
    let mut last: HashMap<String, TransferStatus> = HashMap::new();
    while let Some(Ok(())) = sos.select(rx.changed()).await {
        let list = rx.borrow_and_update().clone();
        for t in &list {
            if last.get(&t.file_id) == Some(&t.status) {
                continue;
            }
            last.insert(t.file_id.clone(), t.status);
            match &t.file_path {
                Some(path) if t.status == TransferStatus::Completed => info!(
                    event = "transfer_status",
                    file_id = %t.file_id,
                    name = %t.name,
                    status = ?t.status,
                    path = %path.display(),
                    "{} {:?}",
                    t.name,
                    t.status
                ),
                _ => info!(
                    event = "transfer_status",
                    file_id = %t.file_id,
                    name = %t.name,
                    status = ?t.status,
                    peers = %t.peer_ids,
                    progress = t.progress,
                    "{} {:?}",
                    t.name,
                    t.status
                ),
            }
        }
        last.retain(|id, _| list.iter().any(|t| &t.file_id == id));
    }
}

async fn answer_requests(
    service: TransferService,
    mut requests: broadcast::Receiver<FileTransferRequest>,
    auto_accept: bool,
    sos: SignalOfStop,
) {
    loop {
        let req = match sos.select(requests.recv()).await {
            None | Some(Err(broadcast::error::RecvError::Closed)) => return,
            Some(Err(broadcast::error::RecvError::Lagged(n))) => {
                warn!(event = "requests_lagged", skipped = n, "Missed inbound requests");
                continue;
            }
            Some(Ok(req)) => req,
        };
        info!(
            event = "incoming_request",
            peer_id = %req.from_id,
            file_id = %req.file_id,
            name = %req.file_name,
            bytes = req.file_size,
            auto_accept,
            "Incoming file"
        );
        let result = if auto_accept {
            service.accept_transfer(&req.file_id).await
        } else {
            service.reject_transfer(&req.file_id).await
        };
        if let Err(e) = result {
            warn!(event = "request_answer_failed", file_id = %req.file_id, error = %e, "Could not answer request");
        }
    }
}

/// Wait until every target shows up in the relay's client list, then send.
async fn send_when_online(
    service: TransferService,
    path: PathBuf,
    targets: Vec<String>,
    mut clients: watch::Receiver<Vec<String>>,
    sos: SignalOfStop,
) {
    info!(event = "send_waiting_for_targets", targets = ?targets, "Waiting for targets to come online");
    let online = matches!(
        sos.select(clients.wait_for(|list| targets.iter().all(|t| list.contains(t))))
            .await,
        Some(Ok(_))
    );
    if !online {
        return;
    }
    match service.send_file(&path, &targets).await {
        Ok(file_id) => info!(event = "send_started_cli", file_id = %file_id, path = %path.display(), "Transfer started"),
        Err(e) => error!(event = "send_file_failed", path = %path.display(), error = %e, "Could not start transfer"),
    }
}
