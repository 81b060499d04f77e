//! End-to-end pipeline and transition tests against in-memory provider
//! fakes: empty upstream, group creation, tier promotion on purchase,
//! matrix-driven campaign transition, stop/resume, and the validation sweep.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tiersync::config::TierConfig;
use tiersync::db::Database;
use tiersync::error::SyncResult;
use tiersync::models::{
    Campaign, Group, Subscriber, SubscriberStatus, SyncRunStatus, TransitionStatus,
};
use tiersync::providers::dds::{DdsApi, DdsCustomer, DdsProduct, DdsSale, SalesPage};
use tiersync::providers::mlp::{MlpApi, MlpField, MlpGroup, SubscriberPage};
use tiersync::sync::{PipelineOptions, ProgressStore, SyncPipeline};
use tiersync::tiers::TierEngine;
use tiersync::transition::TransitionExecutor;

fn subscriber(id: &str, email: &str) -> Subscriber {
    Subscriber {
        id: id.into(),
        email: email.into(),
        status: SubscriberStatus::Active,
        first_name: None,
        last_name: None,
        display_name: None,
        fields: HashMap::new(),
        subscribed_at: None,
        updated_at: Utc::now(),
    }
}

fn subscriber_with_field(id: &str, email: &str, key: &str, value: &str) -> Subscriber {
    let mut s = subscriber(id, email);
    s.fields.insert(key.to_lowercase(), value.to_string());
    s
}

#[derive(Default)]
struct MlpState {
    campaigns: HashMap<String, String>,
    fields: HashMap<String, MlpField>,
    groups: HashMap<String, MlpGroup>,
    group_members: HashMap<String, Vec<Subscriber>>,
    subscribers: Vec<Subscriber>,
    next_id: u64,
    created_groups: Vec<String>,
    created_fields: Vec<String>,
    created_campaigns: Vec<String>,
    field_updates: Vec<(String, HashMap<String, String>)>,
    subscriber_list_calls: u32,
    stop_after_page: Option<u32>,
}

struct FakeMlp {
    state: Mutex<MlpState>,
    /// Set by tests that stop the sync mid-run; the fake raises the stop
    /// flag after serving `stop_after_page` subscriber pages.
    progress: Mutex<Option<ProgressStore>>,
}

impl FakeMlp {
    fn new() -> Self {
        Self {
            state: Mutex::new(MlpState::default()),
            progress: Mutex::new(None),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut MlpState) -> R) -> R {
        f(&mut self.state.lock())
    }

    fn fresh_id(&self, prefix: &str) -> String {
        let mut state = self.state.lock();
        state.next_id += 1;
        format!("{prefix}-{}", state.next_id)
    }
}

#[async_trait]
impl MlpApi for FakeMlp {
    async fn list_groups(&self) -> SyncResult<Vec<MlpGroup>> {
        Ok(self.with(|s| s.groups.values().cloned().collect()))
    }

    async fn list_subscribers(
        &self,
        cursor: Option<&str>,
        limit: u32,
    ) -> SyncResult<SubscriberPage> {
        let start: usize = cursor.and_then(|c| c.parse().ok()).unwrap_or(0);
        let (page, fire_stop) = self.with(|s| {
            s.subscriber_list_calls += 1;
            let end = (start + limit as usize).min(s.subscribers.len());
            let page = s.subscribers[start..end].to_vec();
            let next = if end < s.subscribers.len() {
                Some(end.to_string())
            } else {
                None
            };
            let fire = s.stop_after_page == Some(s.subscriber_list_calls);
            if fire {
                s.stop_after_page = None;
            }
            (
                SubscriberPage {
                    subscribers: page,
                    next_cursor: next,
                },
                fire,
            )
        });
        if fire_stop {
            let progress = self.progress.lock().clone();
            if let Some(progress) = progress {
                progress.set_stop_flag().await.unwrap();
            }
        }
        Ok(page)
    }

    async fn get_subscriber(&self, id_or_email: &str) -> SyncResult<Subscriber> {
        self.with(|s| {
            s.subscribers
                .iter()
                .find(|sub| sub.id == id_or_email || sub.email == id_or_email)
                .cloned()
        })
        .ok_or_else(|| tiersync::error::SyncError::Client {
            endpoint: "/subscribers/{id}".into(),
            method: "GET".into(),
            status: 404,
        })
    }

    async fn get_group_subscribers(
        &self,
        group_id: &str,
        page: u32,
        per_page: u32,
    ) -> SyncResult<Vec<Subscriber>> {
        Ok(self.with(|s| {
            let members = s.group_members.get(group_id).cloned().unwrap_or_default();
            let start = ((page.max(1) - 1) * per_page) as usize;
            let end = (start + per_page as usize).min(members.len());
            if start >= members.len() {
                Vec::new()
            } else {
                members[start..end].to_vec()
            }
        }))
    }

    async fn get_subscriber_groups(&self, subscriber_id: &str) -> SyncResult<Vec<MlpGroup>> {
        Ok(self.with(|s| {
            s.group_members
                .iter()
                .filter(|(_, members)| members.iter().any(|m| m.id == subscriber_id))
                .filter_map(|(group_id, _)| {
                    s.groups.values().find(|g| &g.id == group_id).cloned()
                })
                .collect()
        }))
    }

    async fn create_group(&self, name: &str) -> SyncResult<MlpGroup> {
        let id = self.fresh_id("g");
        Ok(self.with(|s| {
            let group = MlpGroup {
                id,
                name: name.to_uppercase(),
            };
            s.created_groups.push(group.name.clone());
            s.groups.insert(group.name.clone(), group.clone());
            group
        }))
    }

    async fn create_field(&self, name: &str, field_type: &str) -> SyncResult<MlpField> {
        let id = self.fresh_id("f");
        Ok(self.with(|s| {
            let field = MlpField {
                id,
                name: name.to_uppercase(),
                field_type: field_type.to_string(),
            };
            s.created_fields.push(field.name.clone());
            s.fields.insert(field.name.clone(), field.clone());
            field
        }))
    }

    async fn list_fields(&self) -> SyncResult<Vec<MlpField>> {
        Ok(self.with(|s| s.fields.values().cloned().collect()))
    }

    async fn create_draft_campaign(
        &self,
        name: &str,
        _campaign_type: &str,
        _subject: &str,
    ) -> SyncResult<String> {
        let id = self.fresh_id("c");
        self.with(|s| {
            s.created_campaigns.push(name.to_uppercase());
            s.campaigns.insert(name.to_uppercase(), id.clone());
        });
        Ok(id)
    }

    async fn list_campaigns_name_to_id(&self) -> SyncResult<HashMap<String, String>> {
        Ok(self.with(|s| s.campaigns.clone()))
    }

    async fn add_to_group(&self, subscriber_id: &str, group_id: &str) -> SyncResult<()> {
        self.with(|s| {
            let sub = s
                .group_members
                .values()
                .flatten()
                .find(|m| m.id == subscriber_id)
                .cloned()
                .or_else(|| s.subscribers.iter().find(|m| m.id == subscriber_id).cloned());
            if let Some(sub) = sub {
                let members = s.group_members.entry(group_id.to_string()).or_default();
                if !members.iter().any(|m| m.id == sub.id) {
                    members.push(sub);
                }
            }
        });
        Ok(())
    }

    async fn remove_from_group(&self, subscriber_id: &str, group_id: &str) -> SyncResult<()> {
        self.with(|s| {
            if let Some(members) = s.group_members.get_mut(group_id) {
                members.retain(|m| m.id != subscriber_id);
            }
        });
        Ok(())
    }

    async fn update_subscriber_fields(
        &self,
        subscriber_id: &str,
        fields: &HashMap<String, String>,
    ) -> SyncResult<()> {
        self.with(|s| {
            s.field_updates
                .push((subscriber_id.to_string(), fields.clone()));
            for members in s.group_members.values_mut() {
                for m in members.iter_mut().filter(|m| m.id == subscriber_id) {
                    for (k, v) in fields {
                        m.fields.insert(k.to_lowercase(), v.clone());
                    }
                }
            }
        });
        Ok(())
    }

    async fn bulk_import_to_group(
        &self,
        subscribers: &[Subscriber],
        group_id: &str,
    ) -> SyncResult<usize> {
        self.with(|s| {
            let members = s.group_members.entry(group_id.to_string()).or_default();
            for sub in subscribers {
                if !members.iter().any(|m| m.id == sub.id) {
                    members.push(sub.clone());
                }
            }
        });
        Ok(subscribers.len())
    }

    async fn verify_tier(&self, subscriber_id: &str, expected_tier: &str) -> SyncResult<bool> {
        let suffix = format!("_{}", expected_tier.to_uppercase());
        Ok(self
            .get_subscriber_groups(subscriber_id)
            .await?
            .iter()
            .any(|g| g.name.ends_with(&suffix)))
    }

    fn abort_pending(&self) {}
}

#[derive(Default)]
struct FakeDds {
    products: Vec<DdsProduct>,
    sales: Vec<DdsSale>,
}

#[async_trait]
impl DdsApi for FakeDds {
    async fn list_customers(&self, _page: u32, _size: u32) -> SyncResult<Vec<DdsCustomer>> {
        Ok(Vec::new())
    }

    async fn list_products(&self) -> SyncResult<Vec<DdsProduct>> {
        Ok(self.products.clone())
    }

    async fn list_sales(
        &self,
        product_id: Option<&str>,
        page: u32,
        size: u32,
    ) -> SyncResult<SalesPage> {
        let filtered: Vec<DdsSale> = self
            .sales
            .iter()
            .filter(|s| match product_id {
                Some(pid) => s.product_ids.iter().any(|p| p == pid),
                None => true,
            })
            .cloned()
            .collect();
        let start = ((page.max(1) - 1) * size) as usize;
        let end = (start + size as usize).min(filtered.len());
        let slice = if start >= filtered.len() {
            Vec::new()
        } else {
            filtered[start..end].to_vec()
        };
        Ok(SalesPage {
            emails: slice.iter().map(|s| s.email.clone()).collect(),
            sales: slice,
        })
    }

    async fn has_user_purchased(&self, email: &str, product_id: &str) -> SyncResult<bool> {
        Ok(self.sales.iter().any(|s| {
            s.email.eq_ignore_ascii_case(email) && s.product_ids.iter().any(|p| p == product_id)
        }))
    }

    async fn validate_order(&self, order_id: i64, email: &str) -> SyncResult<bool> {
        Ok(self
            .sales
            .iter()
            .any(|s| s.order_id == order_id && s.email.eq_ignore_ascii_case(email)))
    }
}

fn options() -> PipelineOptions {
    PipelineOptions {
        batch_size: 1000,
        subscribers_per_page: 10,
        max_pages_per_run: 100,
        log_retention_days: 30,
        product_codes: HashMap::new(),
        max_processing: Duration::from_secs(300),
        memory_limit_bytes: u64::MAX,
        memory_threshold_pct: 0.8,
    }
}

fn pipeline(
    db: &Database,
    mlp: &Arc<FakeMlp>,
    dds: Option<Arc<FakeDds>>,
    progress: &ProgressStore,
    opts: PipelineOptions,
) -> SyncPipeline {
    let tiers = Arc::new(TierEngine::from_config(&TierConfig::default()));
    SyncPipeline::new(
        db.clone(),
        Arc::clone(mlp) as Arc<dyn MlpApi>,
        dds.map(|d| d as Arc<dyn DdsApi>),
        tiers,
        progress.clone(),
        opts,
    )
}

#[tokio::test]
async fn empty_world_completes_with_zero_rows() {
    let db = Database::open_in_memory().unwrap();
    let progress = ProgressStore::new(db.clone(), 100);
    let mlp = Arc::new(FakeMlp::new());

    let summary = pipeline(&db, &mlp, None, &progress, options())
        .run()
        .await
        .unwrap();

    assert_eq!(summary.status, SyncRunStatus::Completed);
    assert_eq!(summary.subscribers_synced, 0);

    let records = db.list_sync_records(10).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, SyncRunStatus::Completed);
    assert_eq!(records[0].synced_subscribers, 0);

    assert!(db.list_campaigns().await.unwrap().is_empty());
    assert!(db.list_fields().await.unwrap().is_empty());
    assert!(db.list_groups().await.unwrap().is_empty());
    assert_eq!(db.count_subscribers().await.unwrap(), 0);
}

#[tokio::test]
async fn missing_groups_are_created_and_rerun_is_noop() {
    let db = Database::open_in_memory().unwrap();
    let progress = ProgressStore::new(db.clone(), 100);
    let mlp = Arc::new(FakeMlp::new());

    db.upsert_campaign(&Campaign::new("camp-1".into(), "2025_ARTIST_ALBUM".into()))
        .await
        .unwrap();
    mlp.with(|s| {
        s.campaigns
            .insert("2025_ARTIST_ALBUM".to_string(), "camp-1".to_string());
    });

    pipeline(&db, &mlp, None, &progress, options())
        .run()
        .await
        .unwrap();

    // one group per configured tier, created upstream and mirrored locally
    let created = mlp.with(|s| s.created_groups.clone());
    assert!(created.contains(&"2025_ARTIST_ALBUM_GOLD".to_string()));
    assert_eq!(created.len(), 8);

    let local = db
        .get_group_by_name("2025_ARTIST_ALBUM_GOLD")
        .await
        .unwrap()
        .expect("gold group mirrored locally");
    assert!(mlp.with(|s| s.groups.values().any(|g| g.id == local.id)));

    // the purchase field exists too
    assert_eq!(
        mlp.with(|s| s.created_fields.clone()),
        vec!["2025_ARTIST_ALBUM_PURCHASE".to_string()]
    );

    // second run creates nothing new and adds no rows
    pipeline(&db, &mlp, None, &progress, options())
        .run()
        .await
        .unwrap();
    assert_eq!(mlp.with(|s| s.created_groups.len()), 8);
    assert_eq!(db.list_groups().await.unwrap().len(), 8);
    assert_eq!(db.list_campaigns().await.unwrap().len(), 1);
}

#[tokio::test]
async fn purchase_promotes_tier_and_writes_order_id_upstream() {
    let db = Database::open_in_memory().unwrap();
    let progress = ProgressStore::new(db.clone(), 100);
    let mlp = Arc::new(FakeMlp::new());

    db.upsert_campaign(&Campaign::new("camp-1".into(), "2025_A_B".into()))
        .await
        .unwrap();
    let silver = subscriber("s1", "a@x.io");
    mlp.with(|s| {
        s.campaigns.insert("2025_A_B".to_string(), "camp-1".to_string());
        s.groups.insert(
            "2025_A_B_SILVER".to_string(),
            MlpGroup {
                id: "g-silver".into(),
                name: "2025_A_B_SILVER".into(),
            },
        );
        s.group_members
            .insert("g-silver".to_string(), vec![silver.clone()]);
        s.subscribers.push(silver);
    });

    let dds = Arc::new(FakeDds {
        products: vec![DdsProduct {
            id: "prod-9".into(),
            title: "A - B".into(),
        }],
        sales: vec![DdsSale {
            order_id: 9001,
            email: "a@x.io".into(),
            product_ids: vec!["prod-9".into()],
        }],
    });

    pipeline(&db, &mlp, Some(dds), &progress, options())
        .run()
        .await
        .unwrap();

    // campaign picked up the store product
    let campaign = db.get_campaign_by_name("2025_A_B").await.unwrap().unwrap();
    assert_eq!(campaign.product_id.as_deref(), Some("prod-9"));

    // the order id went out to the purchase field
    let updates = mlp.with(|s| s.field_updates.clone());
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].0, "s1");
    assert_eq!(
        updates[0].1.get("2025_a_b_purchase").map(String::as_str),
        Some("9001")
    );

    // membership landed at SILVER_PURCHASED with the order recorded
    let m = db.get_membership("camp-1", "s1").await.unwrap().unwrap();
    assert_eq!(m.subscriber_tier, "SILVER_PURCHASED");
    assert_eq!(m.purchase_id, Some(9001));

    // and the subscriber moved groups upstream
    let purchased_group = db
        .get_group_by_name("2025_A_B_SILVER_PURCHASED")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(m.group_id, purchased_group.id);
    assert!(mlp.with(|s| {
        s.group_members
            .get(&purchased_group.id)
            .map(|members| members.iter().any(|x| x.id == "s1"))
            .unwrap_or(false)
    }));
    assert!(mlp.with(|s| {
        s.group_members
            .get("g-silver")
            .map(|members| members.is_empty())
            .unwrap_or(true)
    }));
}

#[tokio::test]
async fn transition_moves_only_verified_purchasers() {
    let db = Database::open_in_memory().unwrap();
    let progress = ProgressStore::new(db.clone(), 100);
    let mlp = Arc::new(FakeMlp::new());

    for (id, name) in [("c-src", "2025_A_B"), ("c-dst", "2026_A_B")] {
        db.upsert_campaign(&Campaign::new(id.into(), name.into()))
            .await
            .unwrap();
    }
    db.upsert_group(&Group {
        id: "g-src".into(),
        group_name: "2025_A_B_GOLD_PURCHASED".into(),
        campaign_id: "c-src".into(),
    })
    .await
    .unwrap();
    db.upsert_group(&Group {
        id: "g-dst".into(),
        group_name: "2026_A_B_GOLD".into(),
        campaign_id: "c-dst".into(),
    })
    .await
    .unwrap();

    mlp.with(|s| {
        s.group_members.insert(
            "g-src".to_string(),
            vec![
                subscriber_with_field("s1", "one@x.io", "2025_A_B_PURCHASE", "1001"),
                subscriber_with_field("s2", "two@x.io", "2025_A_B_PURCHASE", "1002"),
                subscriber_with_field("s3", "three@x.io", "2025_A_B_PURCHASE", "1003"),
            ],
        );
    });

    // orders 1001 and 1002 verify; 1003 does not exist in the store
    let dds = Arc::new(FakeDds {
        products: Vec::new(),
        sales: vec![
            DdsSale {
                order_id: 1001,
                email: "one@x.io".into(),
                product_ids: vec![],
            },
            DdsSale {
                order_id: 1002,
                email: "two@x.io".into(),
                product_ids: vec![],
            },
        ],
    });

    let executor = TransitionExecutor::new(
        db.clone(),
        Arc::clone(&mlp) as Arc<dyn MlpApi>,
        Some(dds as Arc<dyn DdsApi>),
        Arc::new(TierEngine::from_config(&TierConfig::default())),
        progress,
        100,
        3,
    );
    let report = executor.run("2025_A_B", "2026_A_B").await.unwrap();

    assert_eq!(report.transferred, 2);
    assert_eq!(
        db.count_transition_subscribers(&report.transition_id)
            .await
            .unwrap(),
        2
    );
    let t = db
        .get_transition(&report.transition_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(t.status, TransitionStatus::Complete);
    assert_eq!(t.count_transferred, 2);

    let imported = mlp.with(|s| s.group_members.get("g-dst").cloned().unwrap_or_default());
    let mut emails: Vec<String> = imported.iter().map(|s| s.email.clone()).collect();
    emails.sort();
    assert_eq!(emails, vec!["one@x.io".to_string(), "two@x.io".to_string()]);
}

#[tokio::test]
async fn transition_fails_on_unknown_campaign() {
    let db = Database::open_in_memory().unwrap();
    let progress = ProgressStore::new(db.clone(), 100);
    let mlp = Arc::new(FakeMlp::new());
    let executor = TransitionExecutor::new(
        db,
        mlp as Arc<dyn MlpApi>,
        None,
        Arc::new(TierEngine::from_config(&TierConfig::default())),
        progress,
        100,
        3,
    );
    assert!(executor.run("2025_NO_ONE", "2026_NO_ONE").await.is_err());
}

#[tokio::test]
async fn stop_mid_subscribers_checkpoints_and_resumes() {
    let db = Database::open_in_memory().unwrap();
    let progress = ProgressStore::new(db.clone(), 100);
    let mlp = Arc::new(FakeMlp::new());
    *mlp.progress.lock() = Some(progress.clone());

    mlp.with(|s| {
        for i in 0..100 {
            s.subscribers
                .push(subscriber(&format!("s{i}"), &format!("u{i}@x.io")));
        }
        s.stop_after_page = Some(3);
    });

    let summary = pipeline(&db, &mlp, None, &progress, options())
        .run()
        .await
        .unwrap();
    assert_eq!(summary.status, SyncRunStatus::Stopped);

    // pages 1-3 persisted, checkpoint points at page 4
    assert_eq!(db.count_subscribers().await.unwrap(), 30);
    let cp = progress.load_checkpoint().await.unwrap().unwrap();
    assert_eq!(cp.stage, 4);
    assert_eq!(cp.next_page, 4);
    assert_eq!(cp.cursor.as_deref(), Some("30"));

    // no further subscriber request went out after the stop flag fired
    assert_eq!(mlp.with(|s| s.subscriber_list_calls), 3);

    let records = db.list_sync_records(10).await.unwrap();
    assert_eq!(records[0].status, SyncRunStatus::Stopped);

    // restart resumes from the cursor with no duplicate inserts
    let summary = pipeline(&db, &mlp, None, &progress, options())
        .run()
        .await
        .unwrap();
    assert_eq!(summary.status, SyncRunStatus::Completed);
    assert_eq!(db.count_subscribers().await.unwrap(), 100);
    assert!(progress.load_checkpoint().await.unwrap().is_none());
}

#[tokio::test]
async fn invalid_emails_are_skipped_not_fatal() {
    let db = Database::open_in_memory().unwrap();
    let progress = ProgressStore::new(db.clone(), 100);
    let mlp = Arc::new(FakeMlp::new());
    mlp.with(|s| {
        s.subscribers.push(subscriber("s1", "good@x.io"));
        s.subscribers.push(subscriber("s2", "not-an-email"));
        s.subscribers.push(subscriber("s3", "also@x.io"));
    });

    let summary = pipeline(&db, &mlp, None, &progress, options())
        .run()
        .await
        .unwrap();

    assert_eq!(summary.status, SyncRunStatus::Completed);
    assert_eq!(db.count_subscribers().await.unwrap(), 2);

    let errors = progress.list_errors(10).await.unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].kind, "validation");
    assert_eq!(errors[0].item.as_deref(), Some("not-an-email"));
}

#[tokio::test]
async fn sync_twice_produces_identical_state() {
    let db = Database::open_in_memory().unwrap();
    let progress = ProgressStore::new(db.clone(), 100);
    let mlp = Arc::new(FakeMlp::new());

    db.upsert_campaign(&Campaign::new("camp-1".into(), "2025_A_B".into()))
        .await
        .unwrap();
    let member = subscriber_with_field("s1", "a@x.io", "2025_A_B_PURCHASE", "77");
    mlp.with(|s| {
        s.campaigns.insert("2025_A_B".to_string(), "camp-1".to_string());
        s.groups.insert(
            "2025_A_B_GOLD".to_string(),
            MlpGroup {
                id: "g-gold".into(),
                name: "2025_A_B_GOLD".into(),
            },
        );
        s.group_members
            .insert("g-gold".to_string(), vec![member.clone()]);
        s.subscribers.push(member);
    });

    pipeline(&db, &mlp, None, &progress, options())
        .run()
        .await
        .unwrap();

    let campaigns = db.list_campaigns().await.unwrap().len();
    let groups = db.list_groups().await.unwrap().len();
    let fields = db.list_fields().await.unwrap().len();
    let members_before = db.list_memberships_for_campaign("camp-1").await.unwrap();

    pipeline(&db, &mlp, None, &progress, options())
        .run()
        .await
        .unwrap();

    assert_eq!(db.list_campaigns().await.unwrap().len(), campaigns);
    assert_eq!(db.list_groups().await.unwrap().len(), groups);
    assert_eq!(db.list_fields().await.unwrap().len(), fields);
    let members_after = db.list_memberships_for_campaign("camp-1").await.unwrap();
    assert_eq!(members_after.len(), members_before.len());
    assert_eq!(
        members_after[0].subscriber_tier,
        members_before[0].subscriber_tier
    );
    assert_eq!(members_after[0].purchase_id, members_before[0].purchase_id);
}

#[tokio::test]
async fn membership_disappears_after_upstream_removal() {
    let db = Database::open_in_memory().unwrap();
    let progress = ProgressStore::new(db.clone(), 100);
    let mlp = Arc::new(FakeMlp::new());

    db.upsert_campaign(&Campaign::new("camp-1".into(), "2025_A_B".into()))
        .await
        .unwrap();
    let member = subscriber("s1", "a@x.io");
    mlp.with(|s| {
        s.campaigns.insert("2025_A_B".to_string(), "camp-1".to_string());
        s.groups.insert(
            "2025_A_B_WOOD".to_string(),
            MlpGroup {
                id: "g-wood".into(),
                name: "2025_A_B_WOOD".into(),
            },
        );
        s.group_members
            .insert("g-wood".to_string(), vec![member.clone()]);
        s.subscribers.push(member);
    });

    pipeline(&db, &mlp, None, &progress, options())
        .run()
        .await
        .unwrap();
    assert!(db.get_membership("camp-1", "s1").await.unwrap().is_some());

    // subscriber leaves the group upstream
    mlp.with(|s| {
        s.group_members.get_mut("g-wood").unwrap().clear();
    });
    pipeline(&db, &mlp, None, &progress, options())
        .run()
        .await
        .unwrap();
    assert!(db.get_membership("camp-1", "s1").await.unwrap().is_none());
}

#[tokio::test]
async fn validation_sweep_deletes_groups_gone_upstream() {
    let db = Database::open_in_memory().unwrap();
    let progress = ProgressStore::new(db.clone(), 100);
    let mlp = Arc::new(FakeMlp::new());

    db.upsert_group(&Group {
        id: "g-alive".into(),
        group_name: "2025_A_B_GOLD".into(),
        campaign_id: "camp-1".into(),
    })
    .await
    .unwrap();
    db.upsert_group(&Group {
        id: "g-dead".into(),
        group_name: "2025_A_B_WOOD".into(),
        campaign_id: "camp-1".into(),
    })
    .await
    .unwrap();
    mlp.with(|s| {
        s.groups.insert(
            "2025_A_B_GOLD".to_string(),
            MlpGroup {
                id: "g-alive".into(),
                name: "2025_A_B_GOLD".into(),
            },
        );
    });

    let report = pipeline(&db, &mlp, None, &progress, options())
        .validate_groups()
        .await
        .unwrap();

    assert_eq!(report.checked, 2);
    assert_eq!(report.deleted, vec!["2025_A_B_WOOD".to_string()]);
    assert!(db.get_group_by_id("g-alive").await.unwrap().is_some());
    assert!(db.get_group_by_id("g-dead").await.unwrap().is_none());
}

#[tokio::test]
async fn concurrent_run_is_rejected_by_the_lock() {
    let db = Database::open_in_memory().unwrap();
    let progress = ProgressStore::new(db.clone(), 100);
    progress
        .acquire_run_lock(Duration::from_secs(60))
        .await
        .unwrap();

    // a second store simulates another process
    let other = ProgressStore::new(db.clone(), 100);
    let mlp = Arc::new(FakeMlp::new());
    let result = pipeline(&db, &mlp, None, &other, options()).run().await;
    assert!(result.is_err());
}
