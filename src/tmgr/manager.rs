//! Template Manager (spec §4.4) — one instance per `(Session, ODID, Stream)`
//! namespace.
//!
//! The manager keeps a single flat "current" map plus one active
//! `Snapshot`. Every mutation that changes the current map (`add`,
//! `withdraw`, `withdraw_all`, a UDP lifetime expiry, an IE rebind that
//! actually changes a binding) immediately cuts a new snapshot: the old one
//! is closed at the effective time and moved to a retained list, the new
//! one starts open-ended. This keeps `snapshot()` a cheap `Arc` clone and
//! makes "identical consecutive snapshots are shared" (spec §3) fall out
//! naturally — if nothing changed, there is nothing to cut.

use crate::error::{Error, Result};
use crate::garbage::Garbage;
use crate::ie::IeManager;
use crate::ipfix::template::{Template, TemplateKind};
use crate::tmgr::snapshot::Snapshot;
use std::collections::HashMap;
use std::sync::Arc;

pub struct TemplateManager {
    reliable: bool,
    tmplt_lifetime_s: Option<u32>,
    opts_lifetime_s: Option<u32>,
    snapshot_timeout_s: u32,
    current_time: i64,
    time_initialized: bool,
    current: HashMap<u16, Arc<Template>>,
    active_snapshot: Arc<Snapshot>,
    retained: Vec<Arc<Snapshot>>,
    garbage: Garbage,
}

impl TemplateManager {
    /// `tmplt_lifetime_s`/`opts_lifetime_s` are `Some` for UDP sessions
    /// (spec §4.4 Configuration) and `None` for TCP/SCTP, where templates
    /// never expire on their own.
    pub fn new(reliable: bool, tmplt_lifetime_s: Option<u32>, opts_lifetime_s: Option<u32>, snapshot_timeout_s: u32) -> Self {
        TemplateManager {
            reliable,
            tmplt_lifetime_s,
            opts_lifetime_s,
            snapshot_timeout_s,
            current_time: i64::MIN,
            time_initialized: false,
            current: HashMap::new(),
            active_snapshot: Arc::new(Snapshot::new(HashMap::new(), i64::MIN)),
            retained: Vec::new(),
            garbage: Garbage::new(),
        }
    }

    pub fn current_time(&self) -> i64 {
        self.current_time
    }

    /// Drives the manager's clock from an incoming message's export time
    /// (spec §4.4 Clock). Must be called before any `add`/`withdraw`/`get`
    /// for that message.
    pub fn set_time(&mut self, export_time: i64) -> Result<()> {
        if self.reliable && self.time_initialized && export_time < self.current_time {
            return Err(Error::Denied(format!(
                "export time moved backwards on a reliable transport: {} -> {}",
                self.current_time, export_time
            )));
        }
        self.current_time = export_time;
        self.time_initialized = true;
        self.apply_udp_expiry();
        self.reap_retained_snapshots();
        Ok(())
    }

    fn lifetime_for(&self, kind: TemplateKind) -> Option<u32> {
        match kind {
            TemplateKind::Regular => self.tmplt_lifetime_s,
            TemplateKind::Options => self.opts_lifetime_s,
        }
    }

    /// UDP only: templates whose last refresh is older than their
    /// protocol-specific lifetime are treated as withdrawn at
    /// `last_refresh + lifetime`, processed in timestamp order so multiple
    /// expiries between two `set_time` calls retroactively split the
    /// snapshot history at their true effective times (spec §4.4).
    fn apply_udp_expiry(&mut self) {
        if self.reliable {
            return;
        }
        loop {
            let min_expiry = self
                .current
                .values()
                .filter_map(|t| self.lifetime_for(t.kind).filter(|&l| l > 0).map(|l| t.last_refresh + l as i64))
                .filter(|&expiry| expiry <= self.current_time)
                .min();
            let expiry = match min_expiry {
                Some(e) => e,
                None => break,
            };
            let expired_ids: Vec<u16> = self
                .current
                .iter()
                .filter(|(_, t)| self.lifetime_for(t.kind).filter(|&l| l > 0).map(|l| t.last_refresh + l as i64) == Some(expiry))
                .map(|(id, _)| *id)
                .collect();
            for id in expired_ids {
                self.current.remove(&id);
            }
            self.cut_snapshot_at(expiry);
        }
    }

    fn reap_retained_snapshots(&mut self) {
        let timeout = self.snapshot_timeout_s as i64;
        let cutoff = self.current_time;
        let mut remaining = Vec::with_capacity(self.retained.len());
        for snap in self.retained.drain(..) {
            if snap.validity_end() != i64::MAX && snap.validity_end().saturating_add(timeout) <= cutoff {
                self.garbage.push(snap);
            } else {
                remaining.push(snap);
            }
        }
        self.retained = remaining;
    }

    fn cut_snapshot_at(&mut self, at: i64) {
        if self.active_snapshot.content_equals(&self.current) {
            return;
        }
        self.active_snapshot.close(at);
        self.retained.push(self.active_snapshot.clone());
        self.active_snapshot = Arc::new(Snapshot::new(self.current.clone(), at));
    }

    /// Installs a new Template definition at the current time (spec §4.4
    /// `add`).
    pub fn add(&mut self, mut template: Template) -> Result<()> {
        let id = template.id;
        template.last_refresh = self.current_time;
        if let Some(existing) = self.current.get(&id) {
            if self.reliable {
                if existing.same_definition(&template) {
                    return Ok(()); // common refresh: no-op
                }
                return Err(Error::Arg(format!("template {} redefined with different contents on a reliable transport", id)));
            }
            // UDP: unconditional redefinition; old Arc stays alive through
            // any retained snapshot that already captured it.
        }
        self.current.insert(id, Arc::new(template));
        self.cut_snapshot_at(self.current_time);
        Ok(())
    }

    /// TCP/SCTP only (spec §4.4 `withdraw`).
    pub fn withdraw(&mut self, template_id: u16, _kind: TemplateKind) -> Result<()> {
        if !self.reliable {
            return Err(Error::Denied("template withdrawal is not defined for UDP".into()));
        }
        if self.current.remove(&template_id).is_none() {
            return Err(Error::NotFound(format!("template {} is not active", template_id)));
        }
        self.cut_snapshot_at(self.current_time);
        Ok(())
    }

    /// Collective withdrawal per RFC 7011 §8.1: `kind = None` withdraws
    /// everything, `Some(k)` withdraws only that template flavor.
    pub fn withdraw_all(&mut self, kind: Option<TemplateKind>) -> Result<()> {
        if !self.reliable {
            return Err(Error::Denied("template withdrawal is not defined for UDP".into()));
        }
        let ids: Vec<u16> = self.current.iter().filter(|(_, t)| kind.map_or(true, |k| t.kind == k)).map(|(id, _)| *id).collect();
        if ids.is_empty() {
            return Ok(());
        }
        for id in ids {
            self.current.remove(&id);
        }
        self.cut_snapshot_at(self.current_time);
        Ok(())
    }

    /// Definition active at the current export time (spec §4.4 `get`).
    pub fn get(&self, template_id: u16) -> Option<Arc<Template>> {
        self.current.get(&template_id).cloned()
    }

    /// Snapshot active at the current export time (spec §4.4 `snapshot`).
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.active_snapshot.clone()
    }

    /// Stores a flow-key bitmap discovered via a FlowKeys Options Template
    /// and exposes it on subsequent lookups (spec §4.4).
    pub fn annotate_flow_keys(&mut self, template_id: u16, bitmap: u64) -> Result<()> {
        let existing = self.current.get(&template_id).ok_or_else(|| Error::NotFound(format!("template {} is not active", template_id)))?;
        let mut updated = (**existing).clone();
        updated.flow_key_bitmap = Some(bitmap);
        self.current.insert(template_id, Arc::new(updated));
        self.cut_snapshot_at(self.current_time);
        Ok(())
    }

    /// Re-resolves every field's IE descriptor against a (possibly newly
    /// populated) registry; fields that no longer resolve lose their
    /// binding (spec §4.4 "IE manager rebinding").
    pub fn rebind_ie_manager(&mut self, ie_mgr: &dyn IeManager) {
        let mut any_changed = false;
        let ids: Vec<u16> = self.current.keys().cloned().collect();
        for id in ids {
            let existing = self.current.get(&id).unwrap();
            let mut updated = (**existing).clone();
            let mut changed = false;
            for field in updated.fields.iter_mut() {
                let resolved = ie_mgr.lookup(field.pen, field.id);
                if resolved != field.ie {
                    field.ie = resolved;
                    changed = true;
                }
            }
            if changed {
                self.current.insert(id, Arc::new(updated));
                any_changed = true;
            }
        }
        if any_changed {
            self.cut_snapshot_at(self.current_time);
        }
    }

    /// Drains accumulated evictions into a standalone bundle (spec §4.4
    /// `take_garbage`).
    pub fn take_garbage(&mut self) -> Garbage {
        self.garbage.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ie::{DefaultIeManager, IANA_PEN};
    use crate::ipfix::template::{FieldSpec, OptionsTemplateKind};

    fn regular_template(id: u16, fields: Vec<FieldSpec>) -> Template {
        Template {
            id,
            kind: TemplateKind::Regular,
            scope_field_count: 0,
            options_kind: None,
            fields,
            fixed_record_size: Some(0),
            raw: vec![],
            flow_key_bitmap: None,
            last_refresh: 0,
        }
    }

    fn field(id: u16, length: u16) -> FieldSpec {
        FieldSpec { pen: 0, id, length, offset: Some(0), is_last_occurrence: true, ie: None }
    }

    #[test]
    fn udp_redefinition_is_always_allowed() {
        let mut mgr = TemplateManager::new(false, Some(300), None, 5);
        mgr.set_time(100).unwrap();
        mgr.add(regular_template(300, vec![field(1, 4)])).unwrap();
        mgr.add(regular_template(300, vec![field(1, 4), field(2, 4)])).unwrap();
        let t = mgr.get(300).unwrap();
        assert_eq!(t.fields.len(), 2);
    }

    #[test]
    fn tcp_identical_refresh_is_noop() {
        let mut mgr = TemplateManager::new(true, None, None, 0);
        mgr.set_time(100).unwrap();
        mgr.add(regular_template(300, vec![field(1, 4), field(2, 4)])).unwrap();
        let snap_before = mgr.snapshot();
        mgr.set_time(106).unwrap();
        mgr.add(regular_template(300, vec![field(1, 4), field(2, 4)])).unwrap();
        let snap_after = mgr.snapshot();
        assert!(Arc::ptr_eq(&snap_before, &snap_after));
    }

    #[test]
    fn tcp_redefinition_with_different_bytes_errors() {
        let mut mgr = TemplateManager::new(true, None, None, 0);
        mgr.set_time(100).unwrap();
        mgr.add(regular_template(300, vec![field(1, 4), field(2, 4)])).unwrap();
        let err = mgr.add(regular_template(300, vec![field(1, 4), field(2, 4), field(4, 1)])).unwrap_err();
        assert!(matches!(err, Error::Arg(_)));
    }

    #[test]
    fn tcp_export_time_going_backwards_is_denied() {
        let mut mgr = TemplateManager::new(true, None, None, 0);
        mgr.set_time(100).unwrap();
        let err = mgr.set_time(99).unwrap_err();
        assert!(matches!(err, Error::Denied(_)));
    }

    #[test]
    fn udp_permits_non_monotonic_time() {
        let mut mgr = TemplateManager::new(false, Some(0), None, 0);
        mgr.set_time(100).unwrap();
        assert!(mgr.set_time(50).is_ok());
    }

    #[test]
    fn udp_template_expires_after_lifetime() {
        let mut mgr = TemplateManager::new(false, Some(10), None, 0);
        mgr.set_time(0).unwrap();
        mgr.add(regular_template(300, vec![field(1, 4)])).unwrap();
        mgr.set_time(5).unwrap();
        assert!(mgr.get(300).is_some());
        mgr.set_time(15).unwrap();
        assert!(mgr.get(300).is_none());
    }

    #[test]
    fn withdraw_then_readd_on_udp_restores_field_equal_snapshot() {
        let mut mgr = TemplateManager::new(false, Some(0), None, 5);
        mgr.set_time(0).unwrap();
        mgr.add(regular_template(300, vec![field(1, 4)])).unwrap();
        let before = mgr.snapshot();
        // UDP manager has no withdraw operation; simulate by redefining with
        // the same bytes after an intervening unrelated change.
        mgr.add(regular_template(301, vec![field(2, 4)])).unwrap();
        mgr.add(regular_template(300, vec![field(1, 4)])).unwrap();
        let after = mgr.snapshot();
        let before_300 = before.get(300).unwrap();
        let after_300 = after.get(300).unwrap();
        assert!(before_300.same_definition(after_300));
    }

    #[test]
    fn tcp_withdraw_then_get_is_none() {
        let mut mgr = TemplateManager::new(true, None, None, 0);
        mgr.set_time(100).unwrap();
        mgr.add(regular_template(300, vec![field(1, 4)])).unwrap();
        mgr.withdraw(300, TemplateKind::Regular).unwrap();
        assert!(mgr.get(300).is_none());
    }

    #[test]
    fn udp_withdraw_is_denied() {
        let mut mgr = TemplateManager::new(false, Some(0), None, 0);
        mgr.set_time(0).unwrap();
        mgr.add(regular_template(300, vec![field(1, 4)])).unwrap();
        let err = mgr.withdraw(300, TemplateKind::Regular).unwrap_err();
        assert!(matches!(err, Error::Denied(_)));
    }

    #[test]
    fn withdraw_all_removes_matching_kind_only() {
        let mut mgr = TemplateManager::new(true, None, None, 0);
        mgr.set_time(0).unwrap();
        mgr.add(regular_template(300, vec![field(1, 4)])).unwrap();
        let mut opts = regular_template(500, vec![field(1, 4)]);
        opts.kind = TemplateKind::Options;
        opts.options_kind = Some(OptionsTemplateKind::Unknown);
        mgr.add(opts).unwrap();
        mgr.withdraw_all(Some(TemplateKind::Regular)).unwrap();
        assert!(mgr.get(300).is_none());
        assert!(mgr.get(500).is_some());
    }

    #[test]
    fn snapshot_reused_when_nothing_changed() {
        let mut mgr = TemplateManager::new(true, None, None, 0);
        mgr.set_time(0).unwrap();
        mgr.add(regular_template(300, vec![field(1, 4)])).unwrap();
        let a = mgr.snapshot();
        mgr.set_time(10).unwrap();
        let b = mgr.snapshot();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn superseded_snapshot_is_garbage_collected_after_timeout() {
        let mut mgr = TemplateManager::new(true, None, None, 5);
        mgr.set_time(0).unwrap();
        mgr.add(regular_template(300, vec![field(1, 4)])).unwrap();
        mgr.withdraw(300, TemplateKind::Regular).unwrap();
        mgr.set_time(4).unwrap();
        assert_eq!(mgr.take_garbage().len(), 0);
        mgr.set_time(6).unwrap();
        assert_eq!(mgr.take_garbage().len(), 1);
    }

    #[test]
    fn rebind_ie_manager_resolves_fields() {
        let mut mgr = TemplateManager::new(true, None, None, 0);
        mgr.set_time(0).unwrap();
        mgr.add(regular_template(300, vec![field(1, 4)])).unwrap();
        assert!(mgr.get(300).unwrap().fields[0].ie.is_none());
        let ie_mgr = DefaultIeManager::default();
        mgr.rebind_ie_manager(&ie_mgr);
        let t = mgr.get(300).unwrap();
        assert_eq!(t.fields[0].ie.as_ref().unwrap().pen, IANA_PEN);
        assert_eq!(t.fields[0].ie.as_ref().unwrap().name, "octetDeltaCount");
    }

    #[test]
    fn flow_key_annotation_is_exposed_on_lookup() {
        let mut mgr = TemplateManager::new(true, None, None, 0);
        mgr.set_time(0).unwrap();
        mgr.add(regular_template(300, vec![field(1, 4)])).unwrap();
        mgr.annotate_flow_keys(300, 0b101).unwrap();
        assert_eq!(mgr.get(300).unwrap().flow_key_bitmap, Some(0b101));
    }
}
