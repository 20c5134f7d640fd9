//! # Identity Resolution
//!
//! Turns one tracking call into a session and, unless the call is
//! profile-less, the profile that owns it. The payload may carry a profile
//! id, a session id, both or neither; resolution loads what the store
//! knows, creates what it does not, and repairs the inconsistencies in
//! between. Whatever happens, the returned session points at the returned
//! profile and the payload is rewritten to the resolved ids.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::fields::FlatFields;
use crate::model::{Profile, ProfileId, ProfileRef, Session, SessionId, SessionRef, TimeMetadata};
use crate::store::{RecordKind, RecordStore};

/// Input of one tracking call.
///
/// During resolution the payload is mutated in place: its profile and
/// session refs end up holding the resolved canonical ids.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrackerPayload {
    #[serde(default)]
    pub profile: Option<ProfileRef>,
    #[serde(default)]
    pub session: Option<SessionRef>,
    #[serde(default)]
    pub context: FlatFields,
    #[serde(default)]
    pub properties: FlatFields,
    /// Track without attaching the visit to any profile.
    #[serde(default)]
    pub profile_less: bool,
    /// Per-call opt-in to caller-owned profile ids.
    #[serde(default)]
    pub static_profile_id: bool,
    /// Lifecycle times to stamp onto a profile created for this call.
    #[serde(default)]
    pub profile_times: TimeMetadata,
    /// Lifecycle times to stamp onto a session created for this call.
    #[serde(default)]
    pub session_times: TimeMetadata,
}

impl TrackerPayload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_profile(mut self, id: impl Into<ProfileId>) -> Self {
        self.profile = Some(ProfileRef::new(id));
        self
    }

    /// Alias ids the caller claims belong to the same visitor.
    pub fn with_profile_ids<I, T>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<ProfileId>,
    {
        let ids: Vec<ProfileId> = ids.into_iter().map(Into::into).collect();
        match &mut self.profile {
            Some(profile) => profile.ids = ids,
            None => {
                let mut profile = ProfileRef::new(ProfileId::default());
                profile.ids = ids;
                self.profile = Some(profile);
            }
        }
        self
    }

    pub fn with_session(mut self, id: impl Into<SessionId>) -> Self {
        self.session = Some(SessionRef::new(id));
        self
    }

    pub fn with_context(mut self, context: FlatFields) -> Self {
        self.context = context;
        self
    }

    pub fn with_properties(mut self, properties: FlatFields) -> Self {
        self.properties = properties;
        self
    }

    pub fn without_profile(mut self) -> Self {
        self.profile_less = true;
        self
    }

    pub fn with_static_profile_id(mut self) -> Self {
        self.static_profile_id = true;
        self
    }

    pub fn with_profile_times(mut self, times: TimeMetadata) -> Self {
        self.profile_times = times;
        self
    }

    pub fn with_session_times(mut self, times: TimeMetadata) -> Self {
        self.session_times = times;
        self
    }

    /// The profile id the caller supplied, if it is usable.
    pub fn profile_id(&self) -> Option<&ProfileId> {
        self.profile
            .as_ref()
            .map(|p| &p.id)
            .filter(|id| !id.is_blank())
    }

    /// The session id the caller supplied, if it is usable.
    pub fn session_id(&self) -> Option<&SessionId> {
        self.session
            .as_ref()
            .map(|s| &s.id)
            .filter(|id| !id.is_blank())
    }

    /// Rewrite the payload's profile id, keeping any alias claims.
    pub fn replace_profile(&mut self, id: ProfileId) {
        match &mut self.profile {
            Some(profile) => profile.id = id,
            None => self.profile = Some(ProfileRef::new(id)),
        }
    }

    /// Rewrite the payload's session id.
    pub fn replace_session(&mut self, id: SessionId) {
        match &mut self.session {
            Some(session) => session.id = id,
            None => self.session = Some(SessionRef::new(id)),
        }
    }
}

/// What one tracking call resolved to. `profile` is `None` only for
/// profile-less payloads.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub profile: Option<Profile>,
    pub session: Session,
}

/// Resolves payloads against a record store.
pub struct Resolver<'a> {
    store: &'a dyn RecordStore,
    clock: &'a dyn Clock,
}

impl<'a> Resolver<'a> {
    pub fn new(store: &'a dyn RecordStore, clock: &'a dyn Clock) -> Self {
        Self { store, clock }
    }

    /// Resolve `payload` to a session and profile.
    ///
    /// With `static_ids` the caller owns profile id assignment: an unknown
    /// profile id is kept rather than replaced with a random one, and a
    /// payload without a profile id is an error.
    pub async fn resolve(
        &self,
        payload: &mut TrackerPayload,
        static_ids: bool,
    ) -> Result<Resolution> {
        let mut session = self.load_or_create_session(payload).await?;

        // The session absorbs the call's context; the payload wins on
        // colliding paths.
        if !payload.context.is_empty() {
            session.context.extend_from(&payload.context);
            session.op.mark_updated();
        }
        if !payload.properties.is_empty() {
            session.properties.extend_from(&payload.properties);
            session.op.mark_updated();
        }

        if payload.profile_less {
            return Ok(Resolution {
                profile: None,
                session,
            });
        }

        let (mut profile, session) = self.resolve_profile(payload, session, static_ids).await?;

        // Alias claims carried by the payload land on the resolved profile.
        let claimed: Vec<ProfileId> = payload
            .profile
            .as_ref()
            .map(|p| p.ids.clone())
            .unwrap_or_default();
        let mut claimed_new = false;
        for id in claimed {
            if !id.is_blank() {
                claimed_new |= profile.add_alias(id);
            }
        }
        if claimed_new {
            profile.op.mark_updated();
        }

        check_outcome(payload, &profile, &session)?;
        Ok(Resolution {
            profile: Some(profile),
            session,
        })
    }

    async fn load_or_create_session(&self, payload: &mut TrackerPayload) -> Result<Session> {
        let Some(id) = payload.session_id().cloned() else {
            return Ok(self.new_session(payload, None));
        };
        match self.load_session(&id).await? {
            Some(session) if session.has_profile_pointer() => Ok(session),
            Some(_) => {
                // A stored session without an owner cannot be trusted.
                warn!(session_id = %id, "stored session has no profile pointer, replacing it");
                Ok(self.new_session(payload, Some(id)))
            }
            None => Ok(self.new_session(payload, Some(id))),
        }
    }

    /// Fresh session, reusing `id` when the payload supplied one.
    fn new_session(&self, payload: &mut TrackerPayload, id: Option<SessionId>) -> Session {
        let id = id.unwrap_or_else(SessionId::random);
        let mut session = Session::new(id.clone(), self.clock.now());
        if let Some(insert) = payload.session_times.insert {
            session.metadata.time.insert = Some(insert);
        }
        if let Some(update) = payload.session_times.update {
            session.metadata.time.update = Some(update);
        }
        if let Some(profile_id) = payload.profile_id() {
            session.profile = Some(ProfileRef::new(profile_id.clone()));
        }
        payload.replace_session(id);
        session
    }

    async fn resolve_profile(
        &self,
        payload: &mut TrackerPayload,
        session: Session,
        static_ids: bool,
    ) -> Result<(Profile, Session)> {
        if static_ids && payload.profile_id().is_none() {
            return Err(Error::invariant(
                "static profile id requested without a profile id",
            ));
        }
        if payload.profile_id().is_some() {
            self.load_by_payload_profile_id(payload, session, static_ids)
                .await
        } else if session.profile_id().is_some() {
            self.load_by_session_profile_id(payload, session, static_ids)
                .await
        } else {
            Ok(self.synthesize_profile(payload, session, static_ids))
        }
    }

    async fn load_by_payload_profile_id(
        &self,
        payload: &mut TrackerPayload,
        mut session: Session,
        static_ids: bool,
    ) -> Result<(Profile, Session)> {
        let Some(requested) = payload.profile_id().cloned() else {
            return Ok(self.synthesize_profile(payload, session, static_ids));
        };
        // The owner the session arrived with, before resolution touches it.
        let original_owner = session.profile_id().cloned();

        match self.load_profile(&requested).await? {
            Some(profile) => {
                consistency_check(&requested, &profile)?;
                payload.replace_profile(profile.id.clone());

                if let Some(owner) = original_owner {
                    if !profile.answers_for(&owner) {
                        // The session belongs to a different profile. Leave
                        // it untouched and continue this call on a shadow
                        // session owned by the loaded profile.
                        let shadow = self.shadow_session(payload, &session, &profile);
                        warn!(
                            session_id = %session.id,
                            shadow_id = %shadow.id,
                            profile_id = %profile.id,
                            "session is owned by another profile, continuing on a shadow session"
                        );
                        payload.replace_session(shadow.id.clone());
                        return Ok((profile, shadow));
                    }
                }

                session.point_at(profile.id.clone());
                Ok((profile, session))
            }
            None => {
                // Unknown id. When the session points elsewhere, that
                // pointer is the better lead.
                let owner_differs = session
                    .profile_id()
                    .is_some_and(|owner| *owner != requested);
                if owner_differs {
                    self.load_by_session_profile_id(payload, session, static_ids)
                        .await
                } else {
                    Ok(self.synthesize_profile(payload, session, static_ids))
                }
            }
        }
    }

    async fn load_by_session_profile_id(
        &self,
        payload: &mut TrackerPayload,
        mut session: Session,
        static_ids: bool,
    ) -> Result<(Profile, Session)> {
        let Some(owner) = session.profile_id().cloned() else {
            return Ok(self.synthesize_profile(payload, session, static_ids));
        };
        match self.load_profile(&owner).await? {
            Some(profile) => {
                consistency_check(&owner, &profile)?;
                payload.replace_profile(profile.id.clone());
                session.point_at(profile.id.clone());
                Ok((profile, session))
            }
            None => Ok(self.synthesize_profile(payload, session, static_ids)),
        }
    }

    /// Mint the profile a payload failed to resolve. Static deployments
    /// keep the requested id, everyone else gets a random one.
    fn synthesize_profile(
        &self,
        payload: &mut TrackerPayload,
        mut session: Session,
        static_ids: bool,
    ) -> (Profile, Session) {
        let id = if static_ids {
            payload.profile_id().cloned()
        } else {
            None
        }
        .unwrap_or_else(ProfileId::random);

        let mut profile = Profile::new(id.clone(), self.clock.now());
        if let Some(insert) = payload.profile_times.insert {
            profile.metadata.time.insert = Some(insert);
        }
        if let Some(update) = payload.profile_times.update {
            profile.metadata.time.update = Some(update);
        }
        payload.replace_profile(id.clone());
        session.point_at(id);
        (profile, session)
    }

    /// Private copy of `session` owned by `profile`. It carries this call's
    /// context and the shadowed session's lifecycle times.
    fn shadow_session(
        &self,
        payload: &TrackerPayload,
        session: &Session,
        profile: &Profile,
    ) -> Session {
        let mut shadow = Session::new(session.id.shadow(), self.clock.now());
        shadow.metadata.time = session.metadata.time;
        shadow.context = payload.context.clone();
        shadow.properties = payload.properties.clone();
        shadow.profile = Some(ProfileRef::new(profile.id.clone()));
        shadow
    }

    async fn load_session(&self, id: &SessionId) -> Result<Option<Session>> {
        match self
            .store
            .load_by_id(RecordKind::Session, id.as_str())
            .await?
        {
            Some(record) => Ok(Some(Session::from_fields(&record.fields)?)),
            None => Ok(None),
        }
    }

    /// Alias-aware lookup: a profile answers for its canonical id and for
    /// every id in its alternate list. With duplicates present the oldest
    /// record wins.
    async fn load_profile(&self, id: &ProfileId) -> Result<Option<Profile>> {
        let ids = vec![id.as_str().to_string()];
        let mut hits = self
            .store
            .load_by_ids_or_id(RecordKind::Profile, &ids, 2)
            .await?;
        if hits.len() > 1 {
            debug!(profile_id = %id, "multiple profiles answer for one id");
        }
        if hits.is_empty() {
            return Ok(None);
        }
        let record = hits.remove(0);
        Ok(Some(Profile::from_fields(&record.fields)?))
    }
}

/// A loaded profile must answer for the id it was looked up by; anything
/// else means the storage layer returned a stranger.
fn consistency_check(requested: &ProfileId, profile: &Profile) -> Result<()> {
    if profile.answers_for(requested) {
        return Ok(());
    }
    Err(Error::InconsistentLoad {
        requested: requested.clone(),
        loaded: profile.id.clone(),
    })
}

fn check_outcome(payload: &TrackerPayload, profile: &Profile, session: &Session) -> Result<()> {
    if let Some(supplied) = payload.session.as_ref() {
        if supplied.id != session.id {
            return Err(Error::invariant(format!(
                "payload session id {} diverged from resolved session {}",
                supplied.id, session.id
            )));
        }
    }
    if let Some(supplied) = payload.profile.as_ref() {
        if supplied.id != profile.id {
            return Err(Error::invariant(format!(
                "payload profile id {} diverged from resolved profile {}",
                supplied.id, profile.id
            )));
        }
    }
    if session.profile_id() != Some(&profile.id) {
        return Err(Error::invariant(format!(
            "session {} does not point at resolved profile {}",
            session.id, profile.id
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::model::RecordMetadata;
    use crate::store::{MemoryStore, StoredRecord};
    use crate::value::Value;
    use serde_json::json;

    async fn seed_profile(store: &MemoryStore, profile: &Profile) {
        let record = StoredRecord::new(
            profile.flatten(),
            RecordMetadata::new(profile.id.as_str()),
        );
        store.upsert(RecordKind::Profile, record).await.unwrap();
    }

    async fn seed_session(store: &MemoryStore, session: &Session) {
        let record = StoredRecord::new(
            session.flatten(),
            RecordMetadata::new(session.id.as_str()),
        );
        store.upsert(RecordKind::Session, record).await.unwrap();
    }

    fn owned_session(id: &str, owner: &str, at: f64) -> Session {
        let mut session = Session::new(SessionId::from(id), at);
        session.profile = Some(ProfileRef::new(owner));
        session
    }

    #[tokio::test]
    async fn fresh_visitor_gets_new_profile_and_session() {
        let store = MemoryStore::new();
        let clock = FixedClock::new(100.0);
        let resolver = Resolver::new(&store, &clock);

        let mut payload = TrackerPayload::new();
        let resolution = resolver.resolve(&mut payload, false).await.unwrap();

        let profile = resolution.profile.unwrap();
        assert!(profile.op.new);
        assert!(resolution.session.op.new);
        assert_eq!(resolution.session.profile_id(), Some(&profile.id));
        assert_eq!(profile.metadata.time.insert, Some(100.0));
        // The payload now names what was resolved.
        assert_eq!(payload.profile.unwrap().id, profile.id);
        assert_eq!(payload.session.unwrap().id, resolution.session.id);
    }

    #[tokio::test]
    async fn known_ids_load_without_creating_anything() {
        let store = MemoryStore::new();
        let clock = FixedClock::new(200.0);
        let profile = Profile::new(ProfileId::from("p-1"), 100.0);
        seed_profile(&store, &profile).await;
        seed_session(&store, &owned_session("s-1", "p-1", 100.0)).await;

        let resolver = Resolver::new(&store, &clock);
        let mut payload = TrackerPayload::new().with_profile("p-1").with_session("s-1");
        let resolution = resolver.resolve(&mut payload, false).await.unwrap();

        let profile = resolution.profile.unwrap();
        assert_eq!(profile.id.as_str(), "p-1");
        assert!(!profile.op.new);
        assert_eq!(resolution.session.id.as_str(), "s-1");
        assert!(!resolution.session.op.new);
    }

    #[tokio::test]
    async fn unknown_session_id_is_reused_for_the_new_session() {
        let store = MemoryStore::new();
        let clock = FixedClock::new(100.0);
        let resolver = Resolver::new(&store, &clock);

        let mut payload = TrackerPayload::new().with_session("s-supplied");
        let resolution = resolver.resolve(&mut payload, false).await.unwrap();

        assert_eq!(resolution.session.id.as_str(), "s-supplied");
        assert!(resolution.session.op.new);
    }

    #[tokio::test]
    async fn corrupted_session_is_replaced_in_place() {
        let store = MemoryStore::new();
        let clock = FixedClock::new(200.0);
        // Stored session with no owner.
        seed_session(&store, &Session::new(SessionId::from("s-broken"), 100.0)).await;

        let resolver = Resolver::new(&store, &clock);
        let mut payload = TrackerPayload::new().with_session("s-broken");
        let resolution = resolver.resolve(&mut payload, false).await.unwrap();

        assert_eq!(resolution.session.id.as_str(), "s-broken");
        assert!(resolution.session.op.new);
        assert_eq!(
            resolution.session.profile_id(),
            Some(&resolution.profile.unwrap().id)
        );
    }

    #[tokio::test]
    async fn alias_lookup_resolves_to_canonical_id() {
        let store = MemoryStore::new();
        let clock = FixedClock::new(200.0);
        let mut profile = Profile::new(ProfileId::from("p-canonical"), 100.0);
        profile.add_alias(ProfileId::from("p-former"));
        seed_profile(&store, &profile).await;

        let resolver = Resolver::new(&store, &clock);
        let mut payload = TrackerPayload::new().with_profile("p-former");
        let resolution = resolver.resolve(&mut payload, false).await.unwrap();

        let resolved = resolution.profile.unwrap();
        assert_eq!(resolved.id.as_str(), "p-canonical");
        assert_eq!(payload.profile.unwrap().id.as_str(), "p-canonical");
        assert_eq!(
            resolution.session.profile_id().map(|id| id.as_str()),
            Some("p-canonical")
        );
    }

    #[tokio::test]
    async fn foreign_session_owner_forces_a_shadow_session() {
        let store = MemoryStore::new();
        let clock = FixedClock::new(300.0);
        seed_profile(&store, &Profile::new(ProfileId::from("p-mine"), 100.0)).await;
        seed_profile(&store, &Profile::new(ProfileId::from("p-other"), 100.0)).await;
        seed_session(&store, &owned_session("s-1", "p-other", 150.0)).await;

        let resolver = Resolver::new(&store, &clock);
        let mut payload = TrackerPayload::new()
            .with_profile("p-mine")
            .with_session("s-1")
            .with_context(FlatFields::from_nested(&Value::from(json!({
                "browser": "firefox"
            }))));
        let resolution = resolver.resolve(&mut payload, false).await.unwrap();

        let session = &resolution.session;
        assert!(session.id.is_shadow());
        assert_eq!(session.id.as_str(), "shd-s-1");
        assert_eq!(session.profile_id().map(|id| id.as_str()), Some("p-mine"));
        // Lifecycle times follow the shadowed session, context follows
        // this call.
        assert_eq!(session.metadata.time.insert, Some(150.0));
        assert_eq!(
            session.context.get("browser"),
            Some(&Value::from("firefox"))
        );
        assert_eq!(payload.session.unwrap().id.as_str(), "shd-s-1");

        // The stored session still belongs to its owner.
        let stored = store
            .load_by_id(RecordKind::Session, "s-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            stored.fields.get("profile.id"),
            Some(&Value::from("p-other"))
        );
    }

    #[tokio::test]
    async fn unknown_payload_id_falls_back_to_session_owner() {
        let store = MemoryStore::new();
        let clock = FixedClock::new(300.0);
        seed_profile(&store, &Profile::new(ProfileId::from("p-real"), 100.0)).await;
        seed_session(&store, &owned_session("s-1", "p-real", 150.0)).await;

        let resolver = Resolver::new(&store, &clock);
        let mut payload = TrackerPayload::new()
            .with_profile("p-forged")
            .with_session("s-1");
        let resolution = resolver.resolve(&mut payload, false).await.unwrap();

        let profile = resolution.profile.unwrap();
        assert_eq!(profile.id.as_str(), "p-real");
        assert!(!profile.op.new);
        assert_eq!(payload.profile.unwrap().id.as_str(), "p-real");
    }

    #[tokio::test]
    async fn static_ids_keep_the_requested_id_on_miss() {
        let store = MemoryStore::new();
        let clock = FixedClock::new(100.0);
        let resolver = Resolver::new(&store, &clock);

        let mut payload = TrackerPayload::new().with_profile("crm-4711");
        let resolution = resolver.resolve(&mut payload, true).await.unwrap();

        let profile = resolution.profile.unwrap();
        assert_eq!(profile.id.as_str(), "crm-4711");
        assert!(profile.op.new);
    }

    #[tokio::test]
    async fn static_ids_require_a_profile_id() {
        let store = MemoryStore::new();
        let clock = FixedClock::new(100.0);
        let resolver = Resolver::new(&store, &clock);

        let mut payload = TrackerPayload::new();
        let err = resolver.resolve(&mut payload, true).await.unwrap_err();
        assert!(matches!(err, Error::InvariantViolation(_)));
    }

    #[tokio::test]
    async fn profile_less_payload_resolves_to_session_only() {
        let store = MemoryStore::new();
        let clock = FixedClock::new(100.0);
        let resolver = Resolver::new(&store, &clock);

        let mut payload = TrackerPayload::new()
            .without_profile()
            .with_context(FlatFields::from_nested(&Value::from(json!({
                "page": "/pricing"
            }))));
        let resolution = resolver.resolve(&mut payload, false).await.unwrap();

        assert!(resolution.profile.is_none());
        assert_eq!(
            resolution.session.context.get("page"),
            Some(&Value::from("/pricing"))
        );
    }

    #[tokio::test]
    async fn payload_alias_claims_land_on_the_profile() {
        let store = MemoryStore::new();
        let clock = FixedClock::new(200.0);
        seed_profile(&store, &Profile::new(ProfileId::from("p-1"), 100.0)).await;

        let resolver = Resolver::new(&store, &clock);
        let mut payload = TrackerPayload::new()
            .with_profile("p-1")
            .with_profile_ids(["ext-77", "p-1"]);
        let resolution = resolver.resolve(&mut payload, false).await.unwrap();

        let profile = resolution.profile.unwrap();
        assert_eq!(profile.ids, vec![ProfileId::from("ext-77")]);
        assert!(profile.op.update);
    }

    #[tokio::test]
    async fn payload_times_stamp_created_records() {
        let store = MemoryStore::new();
        let clock = FixedClock::new(500.0);
        let resolver = Resolver::new(&store, &clock);

        let mut payload = TrackerPayload::new()
            .with_profile_times(TimeMetadata {
                insert: Some(50.0),
                update: None,
            })
            .with_session_times(TimeMetadata {
                insert: Some(60.0),
                update: Some(61.0),
            });
        let resolution = resolver.resolve(&mut payload, false).await.unwrap();

        let profile = resolution.profile.unwrap();
        assert_eq!(profile.metadata.time.insert, Some(50.0));
        assert_eq!(profile.metadata.time.update, Some(500.0));
        assert_eq!(resolution.session.metadata.time.insert, Some(60.0));
        assert_eq!(resolution.session.metadata.time.update, Some(61.0));
    }
}
