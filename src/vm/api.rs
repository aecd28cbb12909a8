use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use hyper::{Body, Client, Method, Request};
use hyperlocal::{UnixClientExt, Uri};
use serde::Serialize;

/// Boot source section of the VMM control protocol.
#[derive(Debug, Serialize)]
pub struct BootSource {
    pub kernel_image_path: String,
    pub boot_args: String,
}

#[derive(Debug, Serialize)]
pub struct Drive {
    pub drive_id: String,
    pub path_on_host: String,
    pub is_root_device: bool,
    pub is_read_only: bool,
}

#[derive(Debug, Serialize)]
pub struct NetworkInterface {
    pub iface_id: String,
    pub host_dev_name: String,
}

#[derive(Debug, Serialize)]
pub struct MachineConfig {
    pub vcpu_count: u32,
    pub mem_size_mib: u32,
    pub smt: bool,
}

/// Client for one VMM instance's control socket. The protocol is JSON
/// PUTs over a unix domain socket; a 2xx answer means the section was
/// accepted.
pub struct VmmApi {
    socket_path: PathBuf,
}

impl VmmApi {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    /// Polls the socket until the VMM answers, so configuration PUTs do
    /// not race the process start.
    pub async fn wait_ready(&self, limit: Duration) -> Result<()> {
        let started = tokio::time::Instant::now();
        let mut last_error = String::from("vmm api did not answer");
        while started.elapsed() < limit {
            match self.request(Method::GET, "/", None).await {
                Ok(_) => return Ok(()),
                Err(err) => {
                    last_error = format!("{err:#}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
        bail!(
            "vmm api socket {} not ready after {limit:?}: {last_error}",
            self.socket_path.display()
        );
    }

    pub async fn put_machine_config(&self, config: &MachineConfig) -> Result<()> {
        self.put("/machine-config", config).await
    }

    pub async fn put_boot_source(&self, boot_source: &BootSource) -> Result<()> {
        self.put("/boot-source", boot_source).await
    }

    pub async fn put_drive(&self, drive: &Drive) -> Result<()> {
        self.put(&format!("/drives/{}", drive.drive_id), drive).await
    }

    pub async fn put_network_interface(&self, iface: &NetworkInterface) -> Result<()> {
        self.put(&format!("/network-interfaces/{}", iface.iface_id), iface)
            .await
    }

    pub async fn start_instance(&self) -> Result<()> {
        self.put_action("InstanceStart").await
    }

    /// Asks the guest to power off. Firecracker delivers this as a
    /// ctrl-alt-del keypress, which a well-behaved init turns into a
    /// clean shutdown.
    pub async fn send_ctrl_alt_del(&self) -> Result<()> {
        self.put_action("SendCtrlAltDel").await
    }

    async fn put_action(&self, action_type: &str) -> Result<()> {
        self.put(
            "/actions",
            &serde_json::json!({ "action_type": action_type }),
        )
        .await
    }

    async fn put(&self, path: &str, body: &impl Serialize) -> Result<()> {
        let payload = serde_json::to_value(body).context("could not encode vmm request")?;
        self.request(Method::PUT, path, Some(payload)).await?;
        Ok(())
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<String> {
        let client: Client<_, Body> = Client::unix();
        let uri: hyper::Uri = Uri::new(&self.socket_path, path).into();

        let mut builder = Request::builder().method(method.clone()).uri(uri);
        let request_body = match body {
            Some(payload) => {
                builder = builder.header("content-type", "application/json");
                Body::from(payload.to_string())
            }
            None => Body::empty(),
        };
        let request = builder
            .body(request_body)
            .context("could not build vmm request")?;

        let response = client.request(request).await.with_context(|| {
            format!(
                "vmm api transport error on {} via {}",
                path,
                self.socket_path.display()
            )
        })?;
        let status = response.status();
        let bytes = hyper::body::to_bytes(response.into_body())
            .await
            .context("could not read vmm response body")?;
        let raw = String::from_utf8_lossy(&bytes).into_owned();
        if !status.is_success() {
            bail!("vmm api {method} {path} answered {status}: {raw}");
        }
        Ok(raw)
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}
