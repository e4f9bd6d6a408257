//! Host health checks: disk space, network reachability, downloader version.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Deserialize;
use sysinfo::Disks;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::bus::{HealthBar, Notice};
use crate::config::Settings;
use crate::utils::{http_client, time};

/// Address checked for connectivity.
pub const CONNECTIVITY_PROBE: &str = "1.1.1.1:53";
const CONNECTIVITY_TIMEOUT: Duration = Duration::from_secs(10);
const RELEASES_URL: &str = "https://api.github.com/repos/yt-dlp/yt-dlp/releases/latest";

/// Which configured directory a drive entry describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DriveId {
    Output,
    Temporary,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DriveHealth {
    pub directory: PathBuf,
    /// Free fraction of the drive, 0.0 to 1.0.
    pub free_percent: f64,
    pub low_space: bool,
    pub available: bool,
    pub inaccessible: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Connectivity {
    pub local_address: Option<String>,
    pub link_up: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetcherVersion {
    pub current: Option<String>,
    pub latest: Option<String>,
    pub update_available: bool,
}

/// Health collaborator used by the scheduler.
#[async_trait]
pub trait Health: Send {
    async fn disk_health(&mut self) -> BTreeMap<DriveId, DriveHealth>;
    async fn connectivity(&mut self) -> Connectivity;
    async fn fetcher_version(&mut self) -> FetcherVersion;
}

/// One full health check.
#[derive(Debug, Clone, Default)]
pub struct HealthReport {
    pub drives: BTreeMap<DriveId, DriveHealth>,
    pub connectivity: Connectivity,
    pub version: FetcherVersion,
}

impl HealthReport {
    pub async fn collect(health: &mut dyn Health) -> Self {
        Self {
            drives: health.disk_health().await,
            connectivity: health.connectivity().await,
            version: health.fetcher_version().await,
        }
    }

    /// Operator warnings and the status-bar summary for this report.
    pub fn summarize(&self, channels: usize) -> (Vec<Notice>, HealthBar) {
        let mut notices = Vec::new();
        let mut items = vec![format!("Channels: {channels}"), "| Free space:".to_string()];

        for drive in self.drives.values() {
            let directory = drive.directory.display();
            if drive.low_space {
                notices.push(Notice::warning(format!(
                    "Drive space for {directory}: {:.1}% left",
                    drive.free_percent * 100.0
                )));
            }
            if !drive.available {
                notices.push(Notice::warning(format!(
                    "Drive for {directory}: not available"
                )));
            }
            if drive.inaccessible {
                notices.push(Notice::warning(format!(
                    "Drive for {directory}: not accessible"
                )));
            }

            if !drive.available || drive.inaccessible {
                items.push("xxx".to_string());
            } else if drive.low_space {
                items.push(format!("{:.0}%!", drive.free_percent * 100.0));
            } else {
                items.push(format!("{:.0}%", drive.free_percent * 100.0));
            }
        }

        let net = &self.connectivity;
        if let Some(error) = &net.error {
            let state = if net.link_up { "up, but" } else { "down," };
            notices.push(Notice::notice(format!(
                "Network likely {state} with error: {error}"
            )));
        }
        items.push("|".to_string());
        items.push(format!("net {}", if net.link_up { "up" } else { "down" }));
        items.push(format!(
            "({})",
            net.local_address.as_deref().unwrap_or("x.x.x.x")
        ));

        if self.version.update_available {
            if let Some(latest) = &self.version.latest {
                notices.push(Notice::notice(format!(
                    "yt-dlp has an upgrade available: {latest}"
                )));
                items.push(format!("| yt-dlp {latest} update available"));
            }
        }

        (notices, HealthBar { items })
    }
}

/// Checks against the real host.
pub struct SystemHealth {
    output_directory: PathBuf,
    temporary_storage: PathBuf,
    free_percent_limit: f64,
    fetcher_binary: String,
    disks: Disks,
    client: Option<reqwest::Client>,
    version_cache: Option<(NaiveDate, FetcherVersion)>,
}

impl SystemHealth {
    pub fn new(settings: &Arc<Settings>) -> Self {
        let client = match http_client::build_client(Duration::from_secs(10)) {
            Ok(client) => Some(client),
            Err(e) => {
                warn!("HTTP client unavailable, release checks disabled: {}", e);
                None
            }
        };
        Self {
            output_directory: settings.output_directory.clone(),
            temporary_storage: settings.temporary_storage.clone(),
            free_percent_limit: settings.free_percent_limit,
            fetcher_binary: settings.fetcher_binary.clone(),
            disks: Disks::new_with_refreshed_list(),
            client,
            version_cache: None,
        }
    }

    /// Free fraction of the disk holding `path`, by longest mount point.
    fn free_fraction(&self, path: &Path) -> Option<f64> {
        let path = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        self.disks
            .list()
            .iter()
            .filter(|disk| path.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .filter(|disk| disk.total_space() > 0)
            .map(|disk| disk.available_space() as f64 / disk.total_space() as f64)
    }

    async fn drive(&self, directory: &Path) -> DriveHealth {
        let available = tokio::fs::try_exists(directory).await.unwrap_or(false);
        let inaccessible = if available {
            let scratch_dir = directory.to_path_buf();
            tokio::task::spawn_blocking(move || tempfile::tempfile_in(&scratch_dir).is_err())
                .await
                .unwrap_or(true)
        } else {
            true
        };
        let free_percent = self.free_fraction(directory).unwrap_or(0.0);
        DriveHealth {
            directory: directory.to_path_buf(),
            free_percent,
            low_space: available && free_percent < self.free_percent_limit,
            available,
            inaccessible,
        }
    }

    async fn installed_version(&self) -> Option<String> {
        let mut cmd = process_utils::tokio_command(&self.fetcher_binary);
        cmd.arg("--version");
        match cmd.output().await {
            Ok(output) if output.status.success() => {
                let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
                (!version.is_empty()).then_some(version)
            }
            Ok(output) => {
                debug!(status = ?output.status, "Version query failed");
                None
            }
            Err(e) => {
                warn!(binary = %self.fetcher_binary, "Failed to run version query: {}", e);
                None
            }
        }
    }

    async fn latest_release(&self) -> Option<String> {
        #[derive(Deserialize)]
        struct Release {
            tag_name: String,
        }

        let client = self.client.as_ref()?;
        let response = match client.get(RELEASES_URL).send().await {
            Ok(response) => response,
            Err(e) => {
                debug!("Release lookup failed: {}", e);
                return None;
            }
        };
        match response.error_for_status() {
            Ok(response) => response.json::<Release>().await.ok().map(|r| r.tag_name),
            Err(e) => {
                debug!("Release lookup failed: {}", e);
                None
            }
        }
    }
}

#[async_trait]
impl Health for SystemHealth {
    async fn disk_health(&mut self) -> BTreeMap<DriveId, DriveHealth> {
        self.disks = Disks::new_with_refreshed_list();
        let mut drives = BTreeMap::new();
        drives.insert(DriveId::Output, self.drive(&self.output_directory).await);
        drives.insert(
            DriveId::Temporary,
            self.drive(&self.temporary_storage).await,
        );
        drives
    }

    async fn connectivity(&mut self) -> Connectivity {
        let addr: SocketAddr = match CONNECTIVITY_PROBE.parse() {
            Ok(addr) => addr,
            Err(e) => {
                return Connectivity {
                    error: Some(e.to_string()),
                    ..Connectivity::default()
                };
            }
        };
        match tokio::time::timeout(CONNECTIVITY_TIMEOUT, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => Connectivity {
                local_address: stream.local_addr().ok().map(|a| a.ip().to_string()),
                link_up: true,
                error: None,
            },
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => Connectivity {
                local_address: None,
                link_up: true,
                error: Some(e.to_string()),
            },
            Ok(Err(e)) => Connectivity {
                local_address: None,
                link_up: false,
                error: Some(e.to_string()),
            },
            Err(_) => Connectivity {
                local_address: None,
                link_up: false,
                error: Some("timed out".to_string()),
            },
        }
    }

    async fn fetcher_version(&mut self) -> FetcherVersion {
        let today = time::now().date_naive();
        if let Some((date, version)) = &self.version_cache {
            if *date == today {
                return version.clone();
            }
        }

        let current = self.installed_version().await;
        let latest = self.latest_release().await;
        let update_available = matches!((&current, &latest), (Some(c), Some(l)) if c != l);
        let version = FetcherVersion {
            current,
            latest,
            update_available,
        };
        self.version_cache = Some((today, version.clone()));
        version
    }
}
