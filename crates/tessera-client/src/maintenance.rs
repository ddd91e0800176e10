//! Periodic maintenance.
//!
//! One update run covers every local user:
//!
//! 1. Delete stale sessions past their limbo and prune old skipped keys.
//! 2. Rotate the signed prekey when due and post the new one.
//! 3. Drop superseded signed prekeys past their limbo.
//! 4. List the one-time prekeys the server holds, reconcile, and post fresh
//!    ones when it runs low. A server that lost the user gets a new
//!    registration instead.
//!
//! The run completes when every post it caused has been answered, and fails
//! if any step failed.

use tessera_core::{Environment, Storage, prekeys};
use tessera_proto::{ErrorCode, KeyServerRequest, KeyServerResponse};

use crate::{
    error::ManagerError,
    event::{Completion, ManagerAction, RequestId},
    key_exchange::Purpose,
    manager::{Manager, completed},
};

/// An update run waiting for key-server answers.
pub(crate) struct PendingUpdate {
    /// Posts not answered yet.
    remaining: usize,
    /// First failure.
    error: Option<ManagerError>,
}

impl<E: Environment, S: Storage> Manager<E, S> {
    pub(crate) fn handle_update(
        &mut self,
        request: RequestId,
    ) -> Result<Vec<ManagerAction>, ManagerError> {
        let now = self.env.wall_clock_secs();
        let mut actions = Vec::new();
        let mut error = None;

        for device_id in self.storage.list_local_users()? {
            match self.maintain_user(request, &device_id, now) {
                Ok(posts) => actions.extend(posts),
                Err(err) => {
                    tracing::warn!(user = %device_id, %err, "maintenance failed");
                    error.get_or_insert(err);
                },
            }
        }

        if actions.is_empty() {
            let result = error.map_or(Ok(()), Err);
            actions.push(completed(request, Completion::Update(result)));
        } else {
            self.updates.insert(request, PendingUpdate { remaining: actions.len(), error });
        }
        Ok(actions)
    }

    fn maintain_user(
        &mut self,
        update: RequestId,
        device_id: &str,
        now: u64,
    ) -> Result<Vec<ManagerAction>, ManagerError> {
        let mut user = self.user(device_id)?;

        let sweep = self.sessions.sweep(device_id, now, &self.config)?;
        let rotated = prekeys::rotate_signed_prekey(&self.env, &mut user, now, &self.config)?;
        let expired_signed_prekeys = prekeys::sweep_signed_prekeys(&mut user, now, &self.config);
        self.storage.update_local_user(&user)?;

        tracing::info!(
            user = device_id,
            expired_sessions = sweep.expired,
            pruned_keys = sweep.pruned_keys,
            rotated = rotated.is_some(),
            expired_signed_prekeys,
            "maintenance swept"
        );

        let curve = user.curve();
        let url = user.key_server_url.as_str();
        let mut posts = Vec::with_capacity(2);
        if let Some(signed_prekey) = rotated {
            let purpose = Purpose::PostSignedPrekey { update, device_id: device_id.to_string() };
            let request = KeyServerRequest::PostSignedPrekey(signed_prekey);
            posts.push(self.key_exchange.post(purpose, curve, url, device_id, &request)?);
        }
        let purpose = Purpose::ListOneTimePrekeys { update, device_id: device_id.to_string() };
        let request = KeyServerRequest::GetSelfOneTimePrekeys;
        posts.push(self.key_exchange.post(purpose, curve, url, device_id, &request)?);

        Ok(posts)
    }

    /// Reconcile against the server's one-time prekey list.
    ///
    /// Returns the follow-up post, if one is needed.
    pub(crate) fn one_time_prekeys_listed(
        &mut self,
        update: RequestId,
        device_id: &str,
        response: Result<KeyServerResponse, ManagerError>,
    ) -> Result<Option<ManagerAction>, ManagerError> {
        match response {
            Ok(KeyServerResponse::SelfOneTimePrekeys(ids)) => {
                self.replenish(update, device_id, &ids)
            },
            Ok(other) => Err(ManagerError::key_server(format!(
                "expected one-time prekey list, got {:?}",
                other.message_type()
            ))),
            Err(ManagerError::KeyServer { code: Some(ErrorCode::UserNotFound), .. }) => {
                self.reregister(update, device_id)
            },
            Err(err) => Err(err),
        }
    }

    fn replenish(
        &mut self,
        update: RequestId,
        device_id: &str,
        server_ids: &[u32],
    ) -> Result<Option<ManagerAction>, ManagerError> {
        let Some(mut user) = self.storage.load_local_user(device_id)? else {
            return Ok(None);
        };
        let now = self.env.wall_clock_secs();

        let reconciliation =
            prekeys::reconcile_one_time_prekeys(&mut user, server_ids, now, &self.config);
        let fresh =
            prekeys::generate_one_time_prekeys(&self.env, &mut user, reconciliation.to_generate)?;
        self.storage.update_local_user(&user)?;

        tracing::debug!(
            user = device_id,
            held = server_ids.len(),
            dispatched = reconciliation.dispatched,
            expired = reconciliation.expired,
            generated = fresh.len(),
            "one-time prekeys reconciled"
        );

        if fresh.is_empty() {
            return Ok(None);
        }
        let purpose = Purpose::PostOneTimePrekeys { update, device_id: device_id.to_string() };
        let request = KeyServerRequest::PostOneTimePrekeys(fresh);
        let post = self.key_exchange.post(
            purpose,
            user.curve(),
            &user.key_server_url,
            device_id,
            &request,
        )?;
        Ok(Some(post))
    }

    /// Publish the user again, keeping its identity and signed prekey. The
    /// one-time prekeys the lost registration held are treated as handed
    /// out.
    fn reregister(
        &mut self,
        update: RequestId,
        device_id: &str,
    ) -> Result<Option<ManagerAction>, ManagerError> {
        let Some(mut user) = self.storage.load_local_user(device_id)? else {
            return Ok(None);
        };
        let now = self.env.wall_clock_secs();

        prekeys::dispatch_all_one_time_prekeys(&mut user, now);
        let fresh = prekeys::generate_one_time_prekeys(
            &self.env,
            &mut user,
            self.config.initial_one_time_prekeys,
        )?;
        let registration = prekeys::register_request(&user, fresh)?;
        self.storage.update_local_user(&user)?;

        tracing::warn!(user = device_id, "key server lost the user, registering again");

        let purpose = Purpose::Reregister { update, device_id: device_id.to_string() };
        let post = self.key_exchange.post(
            purpose,
            user.curve(),
            &user.key_server_url,
            device_id,
            &registration,
        )?;
        Ok(Some(post))
    }

    /// Account for one answered post of an update run. A follow-up post
    /// takes the answered one's place.
    pub(crate) fn update_step(
        &mut self,
        update: RequestId,
        step: Result<Option<ManagerAction>, ManagerError>,
    ) -> Vec<ManagerAction> {
        let Some(pending) = self.updates.get_mut(&update) else {
            return step.ok().flatten().into_iter().collect();
        };

        match step {
            Ok(Some(post)) => return vec![post],
            Ok(None) => {},
            Err(err) => {
                tracing::warn!(update, %err, "maintenance step failed");
                pending.error.get_or_insert(err);
            },
        }

        pending.remaining = pending.remaining.saturating_sub(1);
        if pending.remaining > 0 {
            return Vec::new();
        }

        let result = self.updates.remove(&update).and_then(|done| done.error).map_or(Ok(()), Err);
        vec![completed(update, Completion::Update(result))]
    }
}
