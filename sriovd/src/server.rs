//! TCP accept loop and request dispatch
//!
//! One task per connection, tracked so that shutdown stops accepting first
//! and then waits for in-flight requests to drain. Every request runs under
//! a transport-default deadline.

use crate::rpc::{ApiCall, ApiError, RequestEnvelope, ResponseEnvelope};
use crate::service::Service;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

const REQUEST_DEADLINE: Duration = Duration::from_secs(30);

pub async fn serve(
    listener: TcpListener,
    service: Arc<Service>,
    shutdown: CancellationToken,
) -> Result<()> {
    let tracker = TaskTracker::new();
    info!("serving on {}", listener.local_addr()?);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        debug!("connection from {peer}");
                        let service = Arc::clone(&service);
                        let shutdown = shutdown.clone();
                        tracker.spawn(async move {
                            if let Err(err) = handle_connection(stream, service, shutdown).await {
                                debug!("connection from {peer} ended: {err:#}");
                            }
                        });
                    }
                    Err(err) => warn!("accept failed: {err}"),
                }
            }
        }
    }

    tracker.close();
    tracker.wait().await;
    info!("server drained");
    Ok(())
}

async fn handle_connection(
    stream: TcpStream,
    service: Arc<Service>,
    shutdown: CancellationToken,
) -> Result<()> {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }

        let response = dispatch(&service, &line).await;
        let mut out = serde_json::to_vec(&response)?;
        out.push(b'\n');
        write.write_all(&out).await?;
    }

    Ok(())
}

async fn dispatch(service: &Service, line: &str) -> ResponseEnvelope {
    let request: RequestEnvelope = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(err) => {
            return ResponseEnvelope::failure(
                0,
                ApiError::invalid_input(format!("malformed request: {err}")),
            );
        }
    };

    let id = request.id;
    match tokio::time::timeout(REQUEST_DEADLINE, handle_call(service, request.call)).await {
        Ok(Ok(value)) => ResponseEnvelope {
            id,
            ok: true,
            result: Some(value),
            error: None,
        },
        Ok(Err(error)) => ResponseEnvelope::failure(id, error),
        Err(_) => ResponseEnvelope::failure(id, ApiError::internal("request deadline exceeded")),
    }
}

async fn handle_call(service: &Service, call: ApiCall) -> Result<serde_json::Value, ApiError> {
    match call {
        ApiCall::ListDevices => to_value(service.list_devices()),
        ApiCall::GetStatus => to_value(service.get_status()),
        ApiCall::AllocateVfs(request) => service.allocate_vfs(&request).and_then(to_value),
        ApiCall::ReleaseVfs(request) => to_value(service.release_vfs(&request.vf_keys)),
        ApiCall::MaskVf(request) => to_value(service.mask_vf(&request.vf_key, &request.reason)),
        ApiCall::UnmaskVf(request) => to_value(service.unmask_vf(&request.vf_key)),
        ApiCall::ListPools => to_value(service.list_pools()),
        ApiCall::GetPoolConfig(request) => service.get_pool_config(&request.name).and_then(to_value),
        ApiCall::DumpInterfaces => to_value(service.dump_interfaces()),
        ApiCall::RefreshDevices => to_value(service.refresh_devices().await),
    }
}

fn to_value<T: serde::Serialize>(value: T) -> Result<serde_json::Value, ApiError> {
    serde_json::to_value(value).map_err(|err| ApiError::internal(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DiscoveryConfig, PoolConfig};
    use crate::discovery::DiscoveryEngine;
    use crate::rpc::ErrorKind;
    use sriov_probe::{PciIdsIndex, Sysfs};
    use std::fs;
    use tempfile::TempDir;

    fn test_service() -> (TempDir, Arc<Service>) {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("bus/pci/devices")).unwrap();
        let discovery = Arc::new(DiscoveryEngine::new(
            Sysfs::new(tmp.path()),
            Arc::new(PciIdsIndex::parse("")),
            DiscoveryConfig::default(),
        ));
        let pools = [PoolConfig {
            name: "p".to_string(),
            pf_pci: "0000:01:00.0".to_string(),
            vf_range: "0-3".to_string(),
            ..Default::default()
        }];
        (tmp, Arc::new(Service::new(discovery, &pools).unwrap()))
    }

    #[tokio::test]
    async fn test_dispatch_malformed_request() {
        let (_tmp, service) = test_service();
        let response = dispatch(&service, "{not json").await;

        assert!(!response.ok);
        assert_eq!(response.id, 0);
        assert_eq!(response.error.unwrap().kind, ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_dispatch_echoes_request_id() {
        let (_tmp, service) = test_service();
        let response = dispatch(&service, r#"{"id":42,"op":"list_pools"}"#).await;

        assert!(response.ok);
        assert_eq!(response.id, 42);
        let pools = response.result.unwrap();
        assert_eq!(pools["pools"][0], "p");
    }

    #[tokio::test]
    async fn test_dispatch_unknown_pool_is_error_envelope() {
        let (_tmp, service) = test_service();
        let response = dispatch(
            &service,
            r#"{"id":1,"op":"get_pool_config","params":{"name":"missing"}}"#,
        )
        .await;

        assert!(!response.ok);
        assert_eq!(response.error.unwrap().kind, ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_dispatch_mask_violation_is_ok_envelope() {
        let (_tmp, service) = test_service();
        dispatch(
            &service,
            r#"{"id":1,"op":"allocate_vfs","params":{"pf_pci":"0000:01:00.0","count":4}}"#,
        )
        .await;

        // precondition violations are success=false payloads, not errors
        let response = dispatch(
            &service,
            r#"{"id":2,"op":"mask_vf","params":{"vf_key":"0000:01:00.0-vf0","reason":"x"}}"#,
        )
        .await;
        assert!(response.ok);
        let ack = response.result.unwrap();
        assert_eq!(ack["success"], false);
        assert_eq!(ack["message"], "Cannot mask allocated VF");
    }
}
