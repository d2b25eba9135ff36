//! Shared test fixtures: an in-memory remote workspace.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use workspace_backup::client::{
    App, ClientError, ClientResult, Item, Organization, RemoteClient, RemoteFile, RetryHint,
    Workspace,
};
use workspace_backup::control::ControlSignals;
use workspace_backup::ledger::RateCategory;

/// Always-failing marker for [`MockRemoteClient::with_flaky`].
pub const ALWAYS: u32 = u32::MAX;

/// In-memory remote hierarchy with failure injection.
///
/// The standard fixture (`MockRemoteClient::small()`) is one organization
/// ("Acme") with two workspaces: Sales (apps Leads and Deals) and HR (app
/// People, which has no items but one app-level file).
///
/// Totals: 1 org, 2 workspaces, 3 apps, 3 items, 4 files, 165 bytes.
pub struct MockRemoteClient {
    orgs: Vec<Organization>,
    workspaces: HashMap<i64, Vec<Workspace>>,
    apps: HashMap<i64, Vec<App>>,
    items: HashMap<i64, Vec<Item>>,
    app_files: HashMap<i64, Vec<RemoteFile>>,
    /// App ids whose item counts were fetched, in order.
    pub count_calls: Mutex<Vec<i64>>,
    /// Download attempts, successful or not.
    pub download_calls: AtomicU64,
    flaky: Mutex<HashMap<String, u32>>,
    limited_once: Mutex<HashMap<String, u64>>,
    limited_always: Mutex<HashMap<String, u64>>,
    cancel_after: Mutex<Option<(u64, ControlSignals)>>,
    calls: AtomicU64,
}

/// Download URL for a fixture file.
pub fn file_url(file_id: i64) -> String {
    format!("https://files.example/{file_id}")
}

fn remote_file(file_id: i64, name: &str, size: u64) -> RemoteFile {
    RemoteFile {
        file_id,
        name: name.to_string(),
        size: Some(size),
        mimetype: Some("application/octet-stream".to_string()),
        link: file_url(file_id),
    }
}

impl MockRemoteClient {
    /// The standard small hierarchy described on the type.
    pub fn small() -> Self {
        let orgs = vec![Organization {
            org_id: 1,
            name: "Acme".to_string(),
        }];
        let workspaces = HashMap::from([(
            1,
            vec![
                Workspace {
                    space_id: 10,
                    name: "Sales".to_string(),
                },
                Workspace {
                    space_id: 11,
                    name: "HR".to_string(),
                },
            ],
        )]);
        let apps = HashMap::from([
            (
                10,
                vec![
                    App {
                        app_id: 100,
                        name: "Leads".to_string(),
                    },
                    App {
                        app_id: 101,
                        name: "Deals".to_string(),
                    },
                ],
            ),
            (
                11,
                vec![App {
                    app_id: 200,
                    name: "People".to_string(),
                }],
            ),
        ]);
        let items = HashMap::from([
            (
                100,
                vec![
                    Item {
                        item_id: 1000,
                        title: Some("Contract".to_string()),
                        files: vec![remote_file(9000, "contract.pdf", 100)],
                    },
                    Item {
                        item_id: 1001,
                        title: Some("Quote".to_string()),
                        files: vec![remote_file(9001, "quote.pdf", 50)],
                    },
                ],
            ),
            (
                101,
                vec![Item {
                    item_id: 1100,
                    title: None,
                    files: vec![remote_file(9100, "deal.xlsx", 10)],
                }],
            ),
        ]);
        let app_files = HashMap::from([(200, vec![remote_file(9200, "handbook.txt", 5)])]);

        Self {
            orgs,
            workspaces,
            apps,
            items,
            app_files,
            count_calls: Mutex::new(Vec::new()),
            download_calls: AtomicU64::new(0),
            flaky: Mutex::new(HashMap::new()),
            limited_once: Mutex::new(HashMap::new()),
            limited_always: Mutex::new(HashMap::new()),
            cancel_after: Mutex::new(None),
            calls: AtomicU64::new(0),
        }
    }

    /// Make a download URL fail `failures` times with a server error
    /// (`ALWAYS` for every attempt).
    pub fn with_flaky(self, url: &str, failures: u32) -> Self {
        self.flaky.lock().unwrap().insert(url.to_string(), failures);
        self
    }

    /// Make one endpoint key (`"/org"`, or a download URL) return a
    /// throttling error with a retry hint, once.
    pub fn with_rate_limited_once(self, key: &str, retry_seconds: u64) -> Self {
        self.limited_once
            .lock()
            .unwrap()
            .insert(key.to_string(), retry_seconds);
        self
    }

    /// Make one endpoint key return a throttling error with a retry hint on
    /// every call.
    pub fn with_rate_limited(self, key: &str, retry_seconds: u64) -> Self {
        self.limited_always
            .lock()
            .unwrap()
            .insert(key.to_string(), retry_seconds);
        self
    }

    /// Fire `signals.cancel()` once the Nth API call starts.
    pub fn set_cancel_after(&self, calls: u64, signals: ControlSignals) {
        *self.cancel_after.lock().unwrap() = Some((calls, signals));
    }

    /// Total API calls issued so far, downloads included.
    pub fn total_calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    fn track(&self) {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let guard = self.cancel_after.lock().unwrap();
        if let Some((after, signals)) = guard.as_ref() {
            if n == *after {
                signals.cancel();
            }
        }
    }

    fn check_limited(&self, key: &str, category: RateCategory) -> ClientResult<()> {
        let seconds = self
            .limited_once
            .lock()
            .unwrap()
            .remove(key)
            .or_else(|| self.limited_always.lock().unwrap().get(key).copied());
        if let Some(seconds) = seconds {
            return Err(ClientError::RateLimited {
                category,
                hint: Some(RetryHint::seconds(seconds)),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteClient for MockRemoteClient {
    async fn organizations(&self) -> ClientResult<Vec<Organization>> {
        self.track();
        self.check_limited("/org", RateCategory::Standard)?;
        Ok(self.orgs.clone())
    }

    async fn workspaces(&self, org_id: i64) -> ClientResult<Vec<Workspace>> {
        self.track();
        self.check_limited(&format!("/space/{org_id}"), RateCategory::Standard)?;
        Ok(self.workspaces.get(&org_id).cloned().unwrap_or_default())
    }

    async fn apps(&self, workspace_id: i64) -> ClientResult<Vec<App>> {
        self.track();
        self.check_limited(&format!("/apps/{workspace_id}"), RateCategory::Standard)?;
        Ok(self.apps.get(&workspace_id).cloned().unwrap_or_default())
    }

    async fn item_count(&self, app_id: i64) -> ClientResult<u64> {
        self.track();
        self.count_calls.lock().unwrap().push(app_id);
        Ok(self.items.get(&app_id).map(|i| i.len() as u64).unwrap_or(0))
    }

    async fn items(&self, app_id: i64, offset: u64, limit: u64) -> ClientResult<Vec<Item>> {
        self.track();
        let all = self.items.get(&app_id).cloned().unwrap_or_default();
        Ok(all
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }

    async fn app_files(&self, app_id: i64) -> ClientResult<Vec<RemoteFile>> {
        self.track();
        Ok(self.app_files.get(&app_id).cloned().unwrap_or_default())
    }

    async fn download_file(&self, url: &str, dest: &Path) -> ClientResult<u64> {
        self.track();
        self.download_calls.fetch_add(1, Ordering::SeqCst);
        self.check_limited(url, RateCategory::Restricted)?;

        {
            let mut flaky = self.flaky.lock().unwrap();
            if let Some(remaining) = flaky.get_mut(url) {
                if *remaining > 0 {
                    if *remaining != ALWAYS {
                        *remaining -= 1;
                    }
                    return Err(ClientError::Api {
                        status: 500,
                        message: "injected failure".to_string(),
                    });
                }
            }
        }

        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(dest, b"payload")?;
        Ok(7)
    }
}
