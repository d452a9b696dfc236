//! The signed-in session: credential pair plus cached profile fields
//!
//! Profile fields are denormalized copies of server-side user state. They are
//! never authoritative and may be stale; they exist so the app can render the
//! header and farm pages without a round trip.

use common::Secret;
use serde::{Deserialize, Serialize};

use crate::credentials::{CredentialStore, StorageKey};
use crate::error::Result;

/// Access + refresh token pair.
///
/// The session counts as authenticated only when both are present.
#[derive(Debug, Clone, Default)]
pub struct CredentialPair {
    pub access_token: Option<Secret<String>>,
    pub refresh_token: Option<Secret<String>>,
}

impl CredentialPair {
    pub fn new(access: impl Into<String>, refresh: impl Into<String>) -> Self {
        Self {
            access_token: Some(Secret::new(access.into())),
            refresh_token: Some(Secret::new(refresh.into())),
        }
    }

    /// Read the pair from the store. Empty strings count as absent.
    pub async fn load(store: &dyn CredentialStore) -> Result<Self> {
        Ok(Self {
            access_token: read_token(store, StorageKey::AccessToken).await?,
            refresh_token: read_token(store, StorageKey::RefreshToken).await?,
        })
    }

    pub fn is_authenticated(&self) -> bool {
        self.access_token.is_some() && self.refresh_token.is_some()
    }
}

/// Read a token key, treating an empty value as absent.
pub async fn read_token(
    store: &dyn CredentialStore,
    key: StorageKey,
) -> Result<Option<Secret<String>>> {
    Ok(store
        .get(key)
        .await?
        .filter(|value| !value.is_empty())
        .map(Secret::new))
}

/// Cached identity fields stored next to the credential pair.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub membership: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub farm_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub farm_location: Option<String>,
}

impl SessionMetadata {
    pub async fn load(store: &dyn CredentialStore) -> Result<Self> {
        Ok(Self {
            user_id: store.get(StorageKey::UserId).await?,
            email: store.get(StorageKey::Email).await?,
            username: store.get(StorageKey::Username).await?,
            membership: store.get(StorageKey::Membership).await?,
            name: store.get(StorageKey::Name).await?,
            farm_name: store.get(StorageKey::FarmName).await?,
            farm_location: store.get(StorageKey::FarmLocation).await?,
        })
    }

    fn entries(&self) -> impl Iterator<Item = (StorageKey, String)> + '_ {
        [
            (StorageKey::UserId, &self.user_id),
            (StorageKey::Email, &self.email),
            (StorageKey::Username, &self.username),
            (StorageKey::Membership, &self.membership),
            (StorageKey::Name, &self.name),
            (StorageKey::FarmName, &self.farm_name),
            (StorageKey::FarmLocation, &self.farm_location),
        ]
        .into_iter()
        .filter_map(|(key, value)| value.clone().map(|v| (key, v)))
    }
}

/// Everything a login flow persists.
#[derive(Debug, Clone, Default)]
pub struct Session {
    pub credentials: CredentialPair,
    pub metadata: SessionMetadata,
}

impl Session {
    pub async fn load(store: &dyn CredentialStore) -> Result<Self> {
        Ok(Self {
            credentials: CredentialPair::load(store).await?,
            metadata: SessionMetadata::load(store).await?,
        })
    }

    /// Replace whatever session was stored with this one.
    pub async fn save(&self, store: &dyn CredentialStore) -> Result<()> {
        let mut entries = Vec::with_capacity(StorageKey::ALL.len());
        if let Some(access) = &self.credentials.access_token {
            entries.push((StorageKey::AccessToken, access.expose().clone()));
        }
        if let Some(refresh) = &self.credentials.refresh_token {
            entries.push((StorageKey::RefreshToken, refresh.expose().clone()));
        }
        entries.extend(self.metadata.entries());
        store.replace(entries).await
    }

    pub fn is_authenticated(&self) -> bool {
        self.credentials.is_authenticated()
    }
}
