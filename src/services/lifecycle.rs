//! Subscription lifecycle manager.
//!
//! Owns the tenant license state machine: trial start, purchase,
//! cancellation, period rollover, trial-to-paid conversion and grace-period
//! lock-out. Every mutating operation registers with the idempotency
//! registry first and short-circuits on replay; all run on an explicit
//! `&mut PgConnection` so the caller composes them into one transaction.

use crate::error::AppError;
use crate::models::{
    AppendEntry, BillingInvoice, BillingTerm, InvoiceStatus, LedgerEntry, LedgerEntryType,
    LicenseStatus, TenantLicense,
};
use crate::services::audit::AuditSink;
use crate::services::idempotency::{self, Registration};
use crate::services::metrics::{DB_QUERY_DURATION, record_license_operation};
use crate::services::{catalog, entitlements, ledger};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::json;
use sqlx::PgConnection;
use tracing::instrument;
use uuid::Uuid;

/// Tunables for the lifecycle state machine, fixed at construction time.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub trial_grace_days: i64,
    pub invoice_due_days: i64,
    pub monthly_period_days: i64,
    pub annual_period_days: i64,
    pub warn_threshold: f64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            trial_grace_days: 7,
            invoice_due_days: 7,
            monthly_period_days: 30,
            annual_period_days: 365,
            warn_threshold: 0.8,
        }
    }
}

/// Caller-supplied price expectation, checked against the server-side SKU
/// price to defend against stale client price caching.
#[derive(Debug, Clone)]
pub struct ExpectedPrice {
    pub amount_cents: i64,
    pub currency: String,
}

/// Result of a purchase: the license, its CHARGE ledger entry and the
/// invoice derived from that entry.
#[derive(Debug, Clone, Serialize)]
pub struct PurchaseOutcome {
    pub license: TenantLicense,
    pub ledger_entry: LedgerEntry,
    pub invoice: BillingInvoice,
    pub replayed: bool,
}

/// Result of a trial start.
#[derive(Debug, Clone, Serialize)]
pub struct TrialOutcome {
    pub license: TenantLicense,
    pub replayed: bool,
}

/// Counts from one sweep tick.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepSummary {
    pub trials_converted: u64,
    pub trials_expired: u64,
    pub periods_rolled: u64,
    pub licenses_locked: u64,
    pub usage_alerts: u64,
}

/// The single predicate deciding whether a license currently grants access.
///
/// CANCELLED is never active. EXPIRED is active only inside an
/// un-read-only grace window: the license stays "active" for period-window
/// purposes while a separate flag blocks writes elsewhere. TRIALING is
/// bounded by both the period and the trial end.
pub fn license_is_active(license: &TenantLicense, at: DateTime<Utc>) -> bool {
    match license.parsed_status() {
        LicenseStatus::Cancelled => false,
        LicenseStatus::Expired => {
            !license.is_read_only
                && license
                    .trial_grace_expires_at
                    .map(|grace| at < grace)
                    .unwrap_or(false)
        }
        LicenseStatus::Trialing => {
            license.current_period_start <= at
                && at < license.current_period_end
                && license.trial_ends_at.map(|t| at < t).unwrap_or(false)
        }
        LicenseStatus::Active => {
            license.current_period_start <= at && at < license.current_period_end
        }
    }
}

#[derive(Clone)]
pub struct LifecycleManager {
    config: LifecycleConfig,
    audit: AuditSink,
}

impl LifecycleManager {
    pub fn new(config: LifecycleConfig, audit: AuditSink) -> Self {
        Self { config, audit }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// End of the billing period starting at `start` for the given term.
    pub fn period_end(&self, start: DateTime<Utc>, term: BillingTerm) -> DateTime<Utc> {
        let days = match term {
            BillingTerm::Monthly => self.config.monthly_period_days,
            BillingTerm::BiAnnual | BillingTerm::Annual => self.config.annual_period_days,
        };
        start + Duration::days(days)
    }

    /// Start a trial license. One trial per SKU per tenant, evergreen: a
    /// consumed trial is detected via any prior license for the SKU with
    /// `trial_started_at` set.
    #[instrument(skip(self, conn), fields(tenant_id = %tenant_id, sku_code = %sku_code))]
    pub async fn start_trial(
        &self,
        conn: &mut PgConnection,
        tenant_id: Uuid,
        sku_code: &str,
        idem_key: &str,
    ) -> Result<TrialOutcome, AppError> {
        let payload = json!({ "op": "trial", "sku_code": sku_code });
        let scope = format!("trial:{}", tenant_id);
        let token = match idempotency::register(conn, &scope, idem_key, &payload).await? {
            Registration::Replay(token) => {
                let license_id = token.entity_id.ok_or_else(|| {
                    AppError::DatabaseError(anyhow::anyhow!("Replayed trial token has no license"))
                })?;
                let license = fetch_license(conn, license_id).await?;
                return Ok(TrialOutcome {
                    license,
                    replayed: true,
                });
            }
            Registration::Fresh(token) => token,
        };

        let sku = catalog::price_for(conn, sku_code).await?;
        if sku.trial_days <= 0 {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "SKU '{}' does not offer a trial",
                sku_code
            )));
        }

        let consumed: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM tenant_licenses
                WHERE tenant_id = $1 AND sku_id = $2 AND trial_started_at IS NOT NULL
            )
            "#,
        )
        .bind(tenant_id)
        .bind(sku.sku_id)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to check trial history: {}", e)))?;

        if consumed {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Trial for SKU '{}' was already consumed by this tenant",
                sku_code
            )));
        }

        let now = Utc::now();
        let trial_ends_at = now + Duration::days(sku.trial_days as i64);

        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_trial_license"])
            .start_timer();

        let license = sqlx::query_as::<_, TenantLicense>(
            r#"
            INSERT INTO tenant_licenses (license_id, tenant_id, sku_id, sku_code, term, status,
                amount_cents, currency, trial_started_at, trial_ends_at,
                current_period_start, current_period_end)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING license_id, tenant_id, sku_id, sku_code, term, status, amount_cents, currency,
                trial_started_at, trial_ends_at, trial_grace_expires_at, is_read_only,
                current_period_start, current_period_end, canceled_at, created_utc, updated_utc
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(tenant_id)
        .bind(sku.sku_id)
        .bind(&sku.code)
        .bind(&sku.term)
        .bind(LicenseStatus::Trialing.as_str())
        .bind(sku.amount_cents)
        .bind(&sku.currency)
        .bind(now)
        .bind(trial_ends_at)
        .bind(now)
        .bind(trial_ends_at)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to create trial license: {}", e)))?;

        timer.observe_duration();

        idempotency::attach_entity(conn, token.token_id, license.license_id).await?;

        record_license_operation(&tenant_id.to_string(), "trial_started");
        if let Err(e) = self
            .audit
            .record(
                Some(tenant_id),
                "TRIAL_STARTED",
                json!({ "license_id": license.license_id, "sku_code": sku.code, "trial_ends_at": trial_ends_at }),
            )
            .await
        {
            tracing::warn!(error = %e, "Audit write failed for trial start");
        }

        Ok(TrialOutcome {
            license,
            replayed: false,
        })
    }

    /// Purchase a SKU: cancels every prior ACTIVE/TRIALING license, creates
    /// a new ACTIVE license with the SKU price copied onto it, appends one
    /// CHARGE ledger entry and derives exactly one invoice from it.
    #[instrument(skip(self, conn, expected), fields(tenant_id = %tenant_id, sku_code = %sku_code))]
    pub async fn purchase(
        &self,
        conn: &mut PgConnection,
        tenant_id: Uuid,
        sku_code: &str,
        idem_key: &str,
        purchase_kind: Option<&str>,
        expected: Option<ExpectedPrice>,
    ) -> Result<PurchaseOutcome, AppError> {
        let payload = json!({
            "op": "purchase",
            "sku_code": sku_code,
            "purchase_kind": purchase_kind,
        });
        let scope = format!("purchase:{}", tenant_id);
        let token = match idempotency::register(conn, &scope, idem_key, &payload).await? {
            Registration::Replay(token) => {
                let license_id = token.entity_id.ok_or_else(|| {
                    AppError::DatabaseError(anyhow::anyhow!(
                        "Replayed purchase token has no license"
                    ))
                })?;
                return self.load_purchase(conn, tenant_id, license_id, idem_key).await;
            }
            Registration::Fresh(token) => token,
        };

        let sku = catalog::price_for(conn, sku_code).await?;

        if let Some(expected) = expected {
            if expected.amount_cents != sku.amount_cents || expected.currency != sku.currency {
                return Err(AppError::BadRequest(anyhow::anyhow!(
                    "Expected price {} {} does not match current price {} {}",
                    expected.amount_cents,
                    expected.currency,
                    sku.amount_cents,
                    sku.currency
                )));
            }
        }

        let now = Utc::now();

        // Purchase forcibly cancels whatever was active or trialing.
        sqlx::query(
            r#"
            UPDATE tenant_licenses
            SET status = 'cancelled', canceled_at = $2, updated_utc = NOW()
            WHERE tenant_id = $1 AND status IN ('active', 'trialing')
            "#,
        )
        .bind(tenant_id)
        .bind(now)
        .execute(&mut *conn)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to cancel prior licenses: {}", e)))?;

        let period_end = self.period_end(now, sku.parsed_term());

        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_license"])
            .start_timer();

        let license = sqlx::query_as::<_, TenantLicense>(
            r#"
            INSERT INTO tenant_licenses (license_id, tenant_id, sku_id, sku_code, term, status,
                amount_cents, currency, current_period_start, current_period_end)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING license_id, tenant_id, sku_id, sku_code, term, status, amount_cents, currency,
                trial_started_at, trial_ends_at, trial_grace_expires_at, is_read_only,
                current_period_start, current_period_end, canceled_at, created_utc, updated_utc
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(tenant_id)
        .bind(sku.sku_id)
        .bind(&sku.code)
        .bind(&sku.term)
        .bind(LicenseStatus::Active.as_str())
        .bind(sku.amount_cents)
        .bind(&sku.currency)
        .bind(now)
        .bind(period_end)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to create license: {}", e)))?;

        timer.observe_duration();

        let entry = ledger::append(
            conn,
            &AppendEntry {
                tenant_id,
                license_id: Some(license.license_id),
                amount_cents: sku.amount_cents,
                currency: sku.currency.clone(),
                entry_type: LedgerEntryType::Charge,
                idempotency_key: idem_key.to_string(),
                description: Some(format!("Purchase of {}", sku.code)),
            },
        )
        .await?;

        let invoice = self
            .create_invoice(conn, tenant_id, license.license_id, &entry, now)
            .await?;

        idempotency::attach_entity(conn, token.token_id, license.license_id).await?;

        record_license_operation(&tenant_id.to_string(), "purchased");
        if let Err(e) = self
            .audit
            .record(
                Some(tenant_id),
                "LICENSE_PURCHASED",
                json!({
                    "license_id": license.license_id,
                    "sku_code": sku.code,
                    "amount_cents": sku.amount_cents,
                    "currency": sku.currency,
                    "purchase_kind": purchase_kind,
                }),
            )
            .await
        {
            tracing::warn!(error = %e, "Audit write failed for purchase");
        }

        Ok(PurchaseOutcome {
            license,
            ledger_entry: entry,
            invoice,
            replayed: false,
        })
    }

    /// Cancel the most recent ACTIVE/TRIALING license, effective at
    /// `effective_date` or now when the caller left it out. Returns None if
    /// the tenant has nothing to cancel.
    ///
    /// Only the caller-supplied fields feed the idempotency hash. A retry of
    /// a request that omitted `effective_date` must hash identically, so the
    /// resolved "now" never enters the payload.
    #[instrument(skip(self, conn), fields(tenant_id = %tenant_id))]
    pub async fn cancel(
        &self,
        conn: &mut PgConnection,
        tenant_id: Uuid,
        effective_date: Option<DateTime<Utc>>,
        idem_key: &str,
    ) -> Result<Option<TenantLicense>, AppError> {
        let payload = json!({
            "op": "cancel",
            "effective": effective_date.map(|d| d.to_rfc3339()),
        });
        let scope = format!("cancel:{}", tenant_id);
        let token = match idempotency::register(conn, &scope, idem_key, &payload).await? {
            Registration::Replay(token) => {
                return match token.entity_id {
                    Some(license_id) => Ok(Some(fetch_license(conn, license_id).await?)),
                    None => Ok(None),
                };
            }
            Registration::Fresh(token) => token,
        };

        let effective = effective_date.unwrap_or_else(Utc::now);

        let current = current_license(conn, tenant_id).await?;
        let Some(current) = current else {
            return Ok(None);
        };

        let timer = DB_QUERY_DURATION
            .with_label_values(&["cancel_license"])
            .start_timer();

        let license = sqlx::query_as::<_, TenantLicense>(
            r#"
            UPDATE tenant_licenses
            SET status = 'cancelled', canceled_at = $2, current_period_end = $2, updated_utc = NOW()
            WHERE license_id = $1
            RETURNING license_id, tenant_id, sku_id, sku_code, term, status, amount_cents, currency,
                trial_started_at, trial_ends_at, trial_grace_expires_at, is_read_only,
                current_period_start, current_period_end, canceled_at, created_utc, updated_utc
            "#,
        )
        .bind(current.license_id)
        .bind(effective)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to cancel license: {}", e)))?;

        timer.observe_duration();

        idempotency::attach_entity(conn, token.token_id, license.license_id).await?;

        record_license_operation(&tenant_id.to_string(), "cancelled");
        if let Err(e) = self
            .audit
            .record(
                Some(tenant_id),
                "LICENSE_CANCELLED",
                json!({ "license_id": license.license_id, "effective": effective.to_rfc3339() }),
            )
            .await
        {
            tracing::warn!(error = %e, "Audit write failed for cancel");
        }

        Ok(Some(license))
    }

    /// The scheduled sweep. Safe to run more than once in the same window:
    /// every transition re-checks current state before acting.
    #[instrument(skip(self, conn))]
    pub async fn roll_periods_and_alert(
        &self,
        conn: &mut PgConnection,
        as_of: DateTime<Utc>,
    ) -> Result<SweepSummary, AppError> {
        let mut summary = SweepSummary::default();

        self.sweep_trials(conn, as_of, &mut summary).await?;
        self.sweep_active_periods(conn, as_of, &mut summary).await?;
        self.sweep_grace_lockouts(conn, as_of, &mut summary).await?;
        self.sweep_usage_thresholds(conn, as_of, &mut summary).await?;

        tracing::info!(
            trials_converted = summary.trials_converted,
            trials_expired = summary.trials_expired,
            periods_rolled = summary.periods_rolled,
            licenses_locked = summary.licenses_locked,
            usage_alerts = summary.usage_alerts,
            "Sweep completed"
        );

        Ok(summary)
    }

    /// Trials past their end: auto-convert when the tenant has a payment
    /// method on file, otherwise expire into the grace window.
    async fn sweep_trials(
        &self,
        conn: &mut PgConnection,
        as_of: DateTime<Utc>,
        summary: &mut SweepSummary,
    ) -> Result<(), AppError> {
        let due = sqlx::query_as::<_, TenantLicense>(
            r#"
            SELECT license_id, tenant_id, sku_id, sku_code, term, status, amount_cents, currency,
                trial_started_at, trial_ends_at, trial_grace_expires_at, is_read_only,
                current_period_start, current_period_end, canceled_at, created_utc, updated_utc
            FROM tenant_licenses
            WHERE status = 'trialing' AND trial_ends_at <= $1
            "#,
        )
        .bind(as_of)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to find due trials: {}", e)))?;

        for license in due {
            let trial_ends_at = match license.trial_ends_at {
                Some(t) => t,
                None => continue,
            };

            let has_payment_method: bool = sqlx::query_scalar(
                "SELECT EXISTS(SELECT 1 FROM payment_methods WHERE tenant_id = $1)",
            )
            .bind(license.tenant_id)
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to check payment methods: {}", e))
            })?;

            if has_payment_method {
                // Auto-convert: the paid period starts where the trial ended.
                let period_end = self.period_end(trial_ends_at, license.parsed_term());
                sqlx::query(
                    r#"
                    UPDATE tenant_licenses
                    SET status = 'active', current_period_start = $2, current_period_end = $3, updated_utc = NOW()
                    WHERE license_id = $1 AND status = 'trialing'
                    "#,
                )
                .bind(license.license_id)
                .bind(trial_ends_at)
                .bind(period_end)
                .execute(&mut *conn)
                .await
                .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to convert trial: {}", e)))?;

                summary.trials_converted += 1;
                record_license_operation(&license.tenant_id.to_string(), "trial_converted");
                if let Err(e) = self
                    .audit
                    .record(
                        Some(license.tenant_id),
                        "TRIAL_CONVERTED",
                        json!({ "license_id": license.license_id, "period_end": period_end }),
                    )
                    .await
                {
                    tracing::warn!(error = %e, "Audit write failed for trial conversion");
                }
            } else {
                // Grace expiry is set once and never re-extended.
                let grace = license
                    .trial_grace_expires_at
                    .unwrap_or(trial_ends_at + Duration::days(self.config.trial_grace_days));
                let read_only = as_of >= grace;

                sqlx::query(
                    r#"
                    UPDATE tenant_licenses
                    SET status = 'expired', trial_grace_expires_at = $2, is_read_only = $3, updated_utc = NOW()
                    WHERE license_id = $1 AND status = 'trialing'
                    "#,
                )
                .bind(license.license_id)
                .bind(grace)
                .bind(read_only)
                .execute(&mut *conn)
                .await
                .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to expire trial: {}", e)))?;

                summary.trials_expired += 1;
                record_license_operation(&license.tenant_id.to_string(), "trial_expired");
                if let Err(e) = self
                    .audit
                    .record(
                        Some(license.tenant_id),
                        "TRIAL_EXPIRED",
                        json!({ "license_id": license.license_id, "grace_expires_at": grace }),
                    )
                    .await
                {
                    tracing::warn!(error = %e, "Audit write failed for trial expiry");
                }
            }
        }

        Ok(())
    }

    /// Active licenses past their period end: roll forward by whole terms
    /// from the previous period end, not from `as_of`, to avoid drift.
    async fn sweep_active_periods(
        &self,
        conn: &mut PgConnection,
        as_of: DateTime<Utc>,
        summary: &mut SweepSummary,
    ) -> Result<(), AppError> {
        let due = sqlx::query_as::<_, TenantLicense>(
            r#"
            SELECT license_id, tenant_id, sku_id, sku_code, term, status, amount_cents, currency,
                trial_started_at, trial_ends_at, trial_grace_expires_at, is_read_only,
                current_period_start, current_period_end, canceled_at, created_utc, updated_utc
            FROM tenant_licenses
            WHERE status = 'active' AND current_period_end <= $1
            "#,
        )
        .bind(as_of)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to find due periods: {}", e)))?;

        for license in due {
            let term = license.parsed_term();
            let mut start = license.current_period_start;
            let mut end = license.current_period_end;
            while end <= as_of {
                start = end;
                end = self.period_end(start, term);
            }

            sqlx::query(
                r#"
                UPDATE tenant_licenses
                SET current_period_start = $2, current_period_end = $3, updated_utc = NOW()
                WHERE license_id = $1 AND status = 'active'
                "#,
            )
            .bind(license.license_id)
            .bind(start)
            .bind(end)
            .execute(&mut *conn)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to roll period: {}", e)))?;

            summary.periods_rolled += 1;
            record_license_operation(&license.tenant_id.to_string(), "period_rolled");
        }

        Ok(())
    }

    /// Expired licenses past grace: flip `is_read_only` exactly once.
    async fn sweep_grace_lockouts(
        &self,
        conn: &mut PgConnection,
        as_of: DateTime<Utc>,
        summary: &mut SweepSummary,
    ) -> Result<(), AppError> {
        let locked = sqlx::query_as::<_, TenantLicense>(
            r#"
            UPDATE tenant_licenses
            SET is_read_only = TRUE, updated_utc = NOW()
            WHERE status = 'expired' AND is_read_only = FALSE
              AND trial_grace_expires_at IS NOT NULL AND trial_grace_expires_at <= $1
            RETURNING license_id, tenant_id, sku_id, sku_code, term, status, amount_cents, currency,
                trial_started_at, trial_ends_at, trial_grace_expires_at, is_read_only,
                current_period_start, current_period_end, canceled_at, created_utc, updated_utc
            "#,
        )
        .bind(as_of)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to lock expired licenses: {}", e)))?;

        for license in locked {
            summary.licenses_locked += 1;
            record_license_operation(&license.tenant_id.to_string(), "locked");
            if let Err(e) = self
                .audit
                .record(
                    Some(license.tenant_id),
                    "LICENSE_LOCKED",
                    json!({ "license_id": license.license_id }),
                )
                .await
            {
                tracing::warn!(error = %e, "Audit write failed for lock-out");
            }
        }

        Ok(())
    }

    /// Meters approaching their resolved limit get a USAGE_THRESHOLD audit
    /// event. Unlimited grants and meters without a matching entitlement
    /// are skipped.
    async fn sweep_usage_thresholds(
        &self,
        conn: &mut PgConnection,
        as_of: DateTime<Utc>,
        summary: &mut SweepSummary,
    ) -> Result<(), AppError> {
        let meters = sqlx::query_as::<_, crate::models::UsageMeter>(
            r#"
            SELECT meter_id, tenant_id, meter_key, unit, used_units, license_id, last_recorded_at, created_utc, updated_utc
            FROM usage_meters
            ORDER BY tenant_id, meter_key
            "#,
        )
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to load usage meters: {}", e)))?;

        let mut resolved_for: Option<(Uuid, std::collections::HashMap<String, crate::models::ResolvedEntitlement>)> = None;

        for meter in meters {
            let stale = !matches!(&resolved_for, Some((tenant, _)) if *tenant == meter.tenant_id);
            if stale {
                let map = entitlements::resolve(conn, meter.tenant_id, as_of).await?;
                resolved_for = Some((meter.tenant_id, map));
            }
            let Some((_, resolved)) = &resolved_for else {
                continue;
            };

            let Some(grant) = resolved.get(&meter.meter_key) else {
                continue;
            };
            if grant.is_unlimited {
                continue;
            }
            let Some(limit) = grant.limit_units else {
                continue;
            };
            if limit <= 0 {
                continue;
            }

            let multiplier =
                entitlements::unit_multiplier(meter.unit.as_deref(), grant.unit.as_deref());
            let used = meter.used_units as f64 * multiplier;
            let ratio = used / limit as f64;

            if ratio >= self.config.warn_threshold {
                summary.usage_alerts += 1;
                if let Err(e) = self
                    .audit
                    .record(
                        Some(meter.tenant_id),
                        "USAGE_THRESHOLD",
                        json!({
                            "meter_key": meter.meter_key,
                            "used_units": meter.used_units,
                            "limit_units": limit,
                            "ratio": ratio,
                        }),
                    )
                    .await
                {
                    tracing::warn!(error = %e, "Audit write failed for usage threshold");
                }
            }
        }

        Ok(())
    }

    async fn create_invoice(
        &self,
        conn: &mut PgConnection,
        tenant_id: Uuid,
        license_id: Uuid,
        entry: &LedgerEntry,
        now: DateTime<Utc>,
    ) -> Result<BillingInvoice, AppError> {
        let status = if entry.amount_cents == 0 {
            InvoiceStatus::Paid
        } else {
            InvoiceStatus::Pending
        };
        let paid_at = (entry.amount_cents == 0).then_some(now);
        let due_at = now + Duration::days(self.config.invoice_due_days);

        let invoice = sqlx::query_as::<_, BillingInvoice>(
            r#"
            INSERT INTO billing_invoices (invoice_id, tenant_id, license_id, ledger_entry_id,
                amount_cents, currency, status, issued_at, due_at, paid_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (ledger_entry_id) DO UPDATE SET status = billing_invoices.status
            RETURNING invoice_id, tenant_id, license_id, ledger_entry_id, amount_cents, currency, status, issued_at, due_at, paid_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(tenant_id)
        .bind(license_id)
        .bind(entry.entry_id)
        .bind(entry.amount_cents)
        .bind(&entry.currency)
        .bind(status.as_str())
        .bind(now)
        .bind(due_at)
        .bind(paid_at)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to create invoice: {}", e)))?;

        Ok(invoice)
    }

    async fn load_purchase(
        &self,
        conn: &mut PgConnection,
        tenant_id: Uuid,
        license_id: Uuid,
        idem_key: &str,
    ) -> Result<PurchaseOutcome, AppError> {
        let license = fetch_license(conn, license_id).await?;

        let entry = sqlx::query_as::<_, LedgerEntry>(
            r#"
            SELECT entry_id, tenant_id, license_id, amount_cents, currency, entry_type, description, idempotency_key, recorded_at
            FROM ledger_entries
            WHERE tenant_id = $1 AND idempotency_key = $2
            "#,
        )
        .bind(tenant_id)
        .bind(idem_key)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to load ledger entry: {}", e)))?;

        let invoice = sqlx::query_as::<_, BillingInvoice>(
            r#"
            SELECT invoice_id, tenant_id, license_id, ledger_entry_id, amount_cents, currency, status, issued_at, due_at, paid_at
            FROM billing_invoices
            WHERE ledger_entry_id = $1
            "#,
        )
        .bind(entry.entry_id)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to load invoice: {}", e)))?;

        Ok(PurchaseOutcome {
            license,
            ledger_entry: entry,
            invoice,
            replayed: true,
        })
    }
}

/// The tenant's current (most recent ACTIVE/TRIALING) license, if any.
#[instrument(skip(conn), fields(tenant_id = %tenant_id))]
pub async fn current_license(
    conn: &mut PgConnection,
    tenant_id: Uuid,
) -> Result<Option<TenantLicense>, AppError> {
    sqlx::query_as::<_, TenantLicense>(
        r#"
        SELECT license_id, tenant_id, sku_id, sku_code, term, status, amount_cents, currency,
            trial_started_at, trial_ends_at, trial_grace_expires_at, is_read_only,
            current_period_start, current_period_end, canceled_at, created_utc, updated_utc
        FROM tenant_licenses
        WHERE tenant_id = $1 AND status IN ('active', 'trialing')
        ORDER BY created_utc DESC
        LIMIT 1
        "#,
    )
    .bind(tenant_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get current license: {}", e)))
}

/// Load a license by id.
#[instrument(skip(conn), fields(license_id = %license_id))]
pub async fn fetch_license(
    conn: &mut PgConnection,
    license_id: Uuid,
) -> Result<TenantLicense, AppError> {
    sqlx::query_as::<_, TenantLicense>(
        r#"
        SELECT license_id, tenant_id, sku_id, sku_code, term, status, amount_cents, currency,
            trial_started_at, trial_ends_at, trial_grace_expires_at, is_read_only,
            current_period_start, current_period_end, canceled_at, created_utc, updated_utc
        FROM tenant_licenses
        WHERE license_id = $1
        "#,
    )
    .bind(license_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to load license: {}", e)))?
    .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("License {} not found", license_id)))
}
