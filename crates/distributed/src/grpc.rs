//! gRPC service/client glue for the master and worker services.
//!
//! RPC schema source: `proto/strobe_distributed.proto`.
//!
//! Master control plane (generated under [`v1`]):
//! - `RegisterWorker`, `NextIoItem`, `NewJob`
//!
//! Worker service:
//! - `NewJob` (invoked by the master; blocks until the pipeline drains)
//!
//! The task set travels as JSON bytes inside [`v1::JobParameters`]; the
//! `-1` drain convention of `NextIoItem` lives only on this wire surface.
//! Sync callers (the worker pull loop, master fan-out threads) bridge onto
//! the async clients with a captured runtime handle; both always run on
//! plain OS threads, never inside the runtime.

use std::sync::{Arc, Mutex as StdMutex};

use strobe_common::{JobId, NodeId, Result, StrobeError};
use tokio::runtime::Handle;
use tonic::transport::Channel;
use tonic::{Request, Response, Status};
use tracing::info;

use crate::master::{run_job, JobParameters, Master, WorkerStub};
use crate::worker::{MasterControlPlane, WorkerController};

#[allow(missing_docs)]
pub mod v1 {
    tonic::include_proto!("strobe.distributed.v1");
}

pub use v1::master_client::MasterClient;
pub use v1::master_server::{Master as MasterRpc, MasterServer};
pub use v1::worker_client::WorkerClient;
pub use v1::worker_server::{Worker as WorkerRpc, WorkerServer};

/// Master gRPC service backed by shared [`Master`] state.
#[derive(Clone)]
pub struct MasterService {
    master: Arc<StdMutex<Master>>,
}

impl MasterService {
    /// Build the service from shared master state.
    pub fn from_shared(master: Arc<StdMutex<Master>>) -> Self {
        Self { master }
    }

    /// Access the shared master state.
    pub fn master(&self) -> Arc<StdMutex<Master>> {
        Arc::clone(&self.master)
    }
}

#[tonic::async_trait]
impl MasterRpc for MasterService {
    async fn register_worker(
        &self,
        request: Request<v1::WorkerInfo>,
    ) -> std::result::Result<Response<v1::Registration>, Status> {
        let info = request.into_inner();
        let stub = Arc::new(GrpcWorkerStub::new(&info.address));
        let node_id = self
            .master
            .lock()
            .expect("master lock poisoned")
            .register_worker(stub)
            .map_err(to_status)?;
        Ok(Response::new(v1::Registration { node_id: node_id.0 }))
    }

    async fn next_io_item(
        &self,
        _request: Request<v1::Empty>,
    ) -> std::result::Result<Response<v1::IoItemReply>, Status> {
        let item_id = self
            .master
            .lock()
            .expect("master lock poisoned")
            .next_io_item();
        Ok(Response::new(v1::IoItemReply { item_id }))
    }

    async fn new_job(
        &self,
        request: Request<v1::JobParameters>,
    ) -> std::result::Result<Response<v1::Empty>, Status> {
        let params = decode_job_parameters(request.into_inner())?;
        let master = Arc::clone(&self.master);
        let job_id = tokio::task::spawn_blocking(move || run_job(&master, params))
            .await
            .map_err(|e| Status::internal(format!("job task join error: {e}")))?
            .map_err(to_status)?;
        info!(job_id = %job_id, "job completed");
        Ok(Response::new(v1::Empty {}))
    }
}

/// Worker gRPC service delegating to a [`WorkerController`].
#[derive(Clone)]
pub struct WorkerService {
    controller: Arc<WorkerController>,
}

impl WorkerService {
    /// Build the service over a connected controller.
    pub fn new(controller: Arc<WorkerController>) -> Self {
        Self { controller }
    }
}

#[tonic::async_trait]
impl WorkerRpc for WorkerService {
    async fn new_job(
        &self,
        request: Request<v1::JobParameters>,
    ) -> std::result::Result<Response<v1::Empty>, Status> {
        let wire = request.into_inner();
        let job_id = JobId(wire.job_id);
        let params = decode_job_parameters(wire)?;
        let controller = Arc::clone(&self.controller);
        tokio::task::spawn_blocking(move || controller.new_job(job_id, &params))
            .await
            .map_err(|e| Status::internal(format!("job task join error: {e}")))?
            .map_err(to_status)?;
        Ok(Response::new(v1::Empty {}))
    }
}

/// Master-side stub dialing a registered worker's service.
///
/// The connection is established per job at `new_job` time; registration
/// only records the address, so workers may register before their service
/// socket is listening.
pub struct GrpcWorkerStub {
    address: String,
    handle: Handle,
}

impl GrpcWorkerStub {
    fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            handle: Handle::current(),
        }
    }
}

impl WorkerStub for GrpcWorkerStub {
    fn address(&self) -> &str {
        &self.address
    }

    fn new_job(&self, job_id: JobId, params: &JobParameters) -> Result<()> {
        let request = encode_job_parameters(job_id, params)?;
        let endpoint = format!("http://{}", self.address);
        self.handle.block_on(async move {
            let mut client = WorkerClient::connect(endpoint)
                .await
                .map_err(map_transport_err)?;
            client
                .new_job(Request::new(request))
                .await
                .map_err(status_to_err)?;
            Ok(())
        })
    }
}

/// Worker-side control plane speaking gRPC to the master.
pub struct GrpcMasterControlPlane {
    client: StdMutex<MasterClient<Channel>>,
    handle: Handle,
}

impl GrpcMasterControlPlane {
    /// Connect the master client to an endpoint such as
    /// `http://127.0.0.1:5001`.
    pub async fn connect(endpoint: &str) -> Result<Self> {
        let client = MasterClient::connect(endpoint.to_string())
            .await
            .map_err(map_transport_err)?;
        Ok(Self {
            client: StdMutex::new(client),
            handle: Handle::current(),
        })
    }
}

impl MasterControlPlane for GrpcMasterControlPlane {
    fn register_worker(&self, address: &str) -> Result<NodeId> {
        let mut client = self.client.lock().expect("master client lock poisoned");
        let reply = self
            .handle
            .block_on(client.register_worker(Request::new(v1::WorkerInfo {
                address: address.to_string(),
            })))
            .map_err(status_to_err)?;
        Ok(NodeId(reply.into_inner().node_id))
    }

    fn next_io_item(&self) -> Result<i64> {
        let mut client = self.client.lock().expect("master client lock poisoned");
        let reply = self
            .handle
            .block_on(client.next_io_item(Request::new(v1::Empty {})))
            .map_err(status_to_err)?;
        Ok(reply.into_inner().item_id)
    }
}

fn encode_job_parameters(job_id: JobId, params: &JobParameters) -> Result<v1::JobParameters> {
    let task_set_json = serde_json::to_vec(&params.task_set)
        .map_err(|e| StrobeError::Rpc(format!("task set encode failed: {e}")))?;
    Ok(v1::JobParameters {
        job_name: params.job_name.clone(),
        job_id: job_id.0,
        task_set_json,
    })
}

fn decode_job_parameters(wire: v1::JobParameters) -> std::result::Result<JobParameters, Status> {
    let task_set = serde_json::from_slice(&wire.task_set_json)
        .map_err(|e| Status::invalid_argument(format!("task set decode failed: {e}")))?;
    Ok(JobParameters {
        job_name: wire.job_name,
        task_set,
    })
}

fn to_status(err: StrobeError) -> Status {
    match err {
        StrobeError::InvalidConfig(msg) => Status::invalid_argument(msg),
        StrobeError::Execution(msg) => Status::internal(msg),
        StrobeError::Storage(msg) => Status::internal(msg),
        StrobeError::Rpc(msg) => Status::unavailable(msg),
        StrobeError::Io(e) => Status::internal(e.to_string()),
        StrobeError::Unsupported(msg) => Status::unimplemented(msg),
    }
}

fn status_to_err(status: Status) -> StrobeError {
    StrobeError::Rpc(format!("{}: {}", status.code(), status.message()))
}

fn map_transport_err(err: tonic::transport::Error) -> StrobeError {
    StrobeError::Rpc(format!("transport error: {err}"))
}
