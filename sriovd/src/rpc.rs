//! remote API framing: newline-delimited JSON envelopes over TCP
//!
//! One request per line, one response per line. The envelope carries a
//! client-chosen id echoed back in the response so callers can pipeline.
//! Precondition violations travel as `success=false` payloads inside an ok
//! response; only malformed requests, unknown pools, and internal faults
//! use the error envelope.

use crate::config::PoolConfig;
use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:50051";

/// error kinds surfaced through the response envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    InvalidInput,
    NotFound,
    PreconditionViolation,
    IoFailure,
    Internal,
}

#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct ApiError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ApiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidInput, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }
}

/// the ten operations of the remote API
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", content = "params", rename_all = "snake_case")]
pub enum ApiCall {
    ListDevices,
    GetStatus,
    AllocateVfs(AllocateRequest),
    ReleaseVfs(ReleaseRequest),
    MaskVf(MaskRequest),
    UnmaskVf(UnmaskRequest),
    ListPools,
    GetPoolConfig(PoolConfigRequest),
    DumpInterfaces,
    RefreshDevices,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub id: u64,
    #[serde(flatten)]
    pub call: ApiCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub id: u64,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

impl ResponseEnvelope {
    pub fn success<T: Serialize>(id: u64, result: &T) -> Self {
        match serde_json::to_value(result) {
            Ok(value) => Self {
                id,
                ok: true,
                result: Some(value),
                error: None,
            },
            Err(err) => Self::failure(id, ApiError::internal(err.to_string())),
        }
    }

    pub fn failure(id: u64, error: ApiError) -> Self {
        Self {
            id,
            ok: false,
            result: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AllocateRequest {
    pub pf_pci: String,
    pub count: u32,
    /// accepted but not honored by the allocator
    #[serde(default)]
    pub numa: String,
    /// accepted but not honored by the allocator
    #[serde(default)]
    pub required_features: Vec<String>,
    /// accepted but not honored by the allocator
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReleaseRequest {
    pub vf_keys: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MaskRequest {
    pub vf_key: String,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnmaskRequest {
    pub vf_key: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolConfigRequest {
    pub name: String,
}

/// one VF as reported by ListDevices and AllocateVfs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VfRecord {
    pub vf_key: String,
    pub pf_pci: String,
    pub allocated: bool,
    pub masked: bool,
    pub pool: String,
    pub timestamp: String,
}

/// one PF record per pool label
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PfRecord {
    pub pf_pci: String,
    pub pool: String,
    pub vfs: Vec<VfRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceList {
    pub pfs: Vec<PfRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStatus {
    pub name: String,
    pub total: usize,
    pub allocated: usize,
    pub masked: usize,
    pub free: usize,
    pub percent_free: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusList {
    pub pools: Vec<PoolStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocateResponse {
    pub vfs: Vec<VfRecord>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseResponse {
    pub released: Vec<String>,
    pub message: String,
}

/// generic success/message payload for mask, unmask, and refresh
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolList {
    pub pools: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DumpResponse {
    pub json: String,
    pub timestamp: String,
    pub version: String,
}

/// blocking-free client over one TCP connection
pub struct RpcClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    next_id: u64,
}

impl RpcClient {
    pub async fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("failed to connect to {addr}"))?;
        let (read, write) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read),
            writer: write,
            next_id: 1,
        })
    }

    /// send one call and wait for its response payload
    pub async fn call<T: DeserializeOwned>(&mut self, call: ApiCall) -> Result<T> {
        let id = self.next_id;
        self.next_id += 1;

        let request = RequestEnvelope { id, call };
        let mut line = serde_json::to_vec(&request)?;
        line.push(b'\n');
        self.writer.write_all(&line).await?;

        let mut response = String::new();
        let n = self.reader.read_line(&mut response).await?;
        if n == 0 {
            bail!("connection closed by server");
        }

        let envelope: ResponseEnvelope =
            serde_json::from_str(&response).context("malformed response envelope")?;
        if envelope.id != id {
            bail!("response id {} does not match request {id}", envelope.id);
        }
        if let Some(error) = envelope.error {
            bail!("{}: {}", error_kind_label(error.kind), error.message);
        }
        let result = envelope
            .result
            .context("ok response with missing result payload")?;
        Ok(serde_json::from_value(result)?)
    }

    pub async fn list_devices(&mut self) -> Result<DeviceList> {
        self.call(ApiCall::ListDevices).await
    }

    pub async fn get_status(&mut self) -> Result<StatusList> {
        self.call(ApiCall::GetStatus).await
    }

    pub async fn allocate_vfs(&mut self, request: AllocateRequest) -> Result<AllocateResponse> {
        self.call(ApiCall::AllocateVfs(request)).await
    }

    pub async fn release_vfs(&mut self, vf_keys: Vec<String>) -> Result<ReleaseResponse> {
        self.call(ApiCall::ReleaseVfs(ReleaseRequest { vf_keys })).await
    }

    pub async fn mask_vf(&mut self, vf_key: String, reason: String) -> Result<AckResponse> {
        self.call(ApiCall::MaskVf(MaskRequest { vf_key, reason })).await
    }

    pub async fn unmask_vf(&mut self, vf_key: String) -> Result<AckResponse> {
        self.call(ApiCall::UnmaskVf(UnmaskRequest { vf_key })).await
    }

    pub async fn list_pools(&mut self) -> Result<PoolList> {
        self.call(ApiCall::ListPools).await
    }

    pub async fn get_pool_config(&mut self, name: String) -> Result<PoolConfig> {
        self.call(ApiCall::GetPoolConfig(PoolConfigRequest { name }))
            .await
    }

    pub async fn dump_interfaces(&mut self) -> Result<DumpResponse> {
        self.call(ApiCall::DumpInterfaces).await
    }

    pub async fn refresh_devices(&mut self) -> Result<AckResponse> {
        self.call(ApiCall::RefreshDevices).await
    }
}

fn error_kind_label(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::InvalidInput => "invalid input",
        ErrorKind::NotFound => "not found",
        ErrorKind::PreconditionViolation => "precondition violation",
        ErrorKind::IoFailure => "io failure",
        ErrorKind::Internal => "internal error",
    }
}
