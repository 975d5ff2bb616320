use std::time::Duration;

use async_trait::async_trait;
use log::{error, info, warn};
use rand::Rng;
use serde::Serialize;

use crate::analytics::{Analytics, FlagResolution, FlagSource};
use crate::error::{Result, SimError};
use crate::game::Variant;
use crate::store::{DeviceStore, USERNAME_KEY, USER_ID_KEY, VARIANT_KEY};

const ADJECTIVES: &[&str] = &[
    "Brave", "Quiet", "Sleepy", "Swift", "Clever", "Lucky", "Mellow", "Bold", "Sunny", "Witty",
];
const ANIMALS: &[&str] = &[
    "Otter", "Fox", "Walrus", "Heron", "Panda", "Lynx", "Gecko", "Badger", "Koala", "Falcon",
];

/// Who is playing and which arm of the experiment they are in.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub username: String,
    pub user_id: String,
    pub variant: Variant,
    /// Raw flag value the variant came from, echoed on every analytics event.
    pub flag_response: String,
}

/// Flag source pinned to one arm, for playing without a flag service.
#[derive(Debug, Clone, Copy)]
pub struct FixedVariant(pub Variant);

#[async_trait]
impl FlagSource for FixedVariant {
    async fn resolve_flag(&self, _flag_key: &str) -> FlagResolution {
        FlagResolution::Resolved(flag_response_for(self.0).to_string())
    }
}

fn flag_response_for(variant: Variant) -> &'static str {
    match variant {
        Variant::A => "control",
        Variant::B => "4-words",
    }
}

pub fn generate_username() -> String {
    let mut rng = rand::thread_rng();
    let adjective = ADJECTIVES[rng.gen_range(0..ADJECTIVES.len())];
    let animal = ANIMALS[rng.gen_range(0..ANIMALS.len())];
    format!("{adjective} {animal}")
}

/// `user_` followed by nine lowercase base-36 characters.
pub fn generate_user_id() -> String {
    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::thread_rng();
    let suffix: String = (0..9)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect();
    format!("user_{suffix}")
}

/// Resolves the experiment arm and the device identity around it.
///
/// A pending flag is retried once after `retry_delay`. Still pending, or an
/// outright error from the flag source, is a configuration error: the caller
/// must refuse to start rather than guess a variant.
pub async fn resolve_identity(
    flags: &dyn FlagSource,
    analytics: &dyn Analytics,
    store: &DeviceStore,
    flag_key: &str,
    retry_delay: Duration,
) -> Result<Identity> {
    let (variant, flag_response) = match resolve_variant(flags, flag_key, retry_delay).await {
        Ok(resolved) => resolved,
        Err(err) => {
            // A variant from an earlier run must not be picked up later.
            if let Err(remove_err) = store.remove(VARIANT_KEY).await {
                warn!("Failed to clear stale variant: {remove_err:#}");
            }
            return Err(err);
        }
    };

    store.set(VARIANT_KEY, variant.as_str()).await?;

    let user_id = generate_user_id();
    store.set(USER_ID_KEY, &user_id).await?;

    let username = match store.get(USERNAME_KEY).await? {
        Some(existing) => existing,
        None => {
            let username = generate_username();
            store.set(USERNAME_KEY, &username).await?;
            info!("Generated username {username}");
            username
        }
    };
    analytics.identify(&username);

    Ok(Identity {
        username,
        user_id,
        variant,
        flag_response,
    })
}

async fn resolve_variant(
    flags: &dyn FlagSource,
    flag_key: &str,
    retry_delay: Duration,
) -> Result<(Variant, String)> {
    for attempt in 1..=2 {
        match flags.resolve_flag(flag_key).await {
            FlagResolution::Resolved(response) => {
                if let Some(variant) = Variant::from_flag_response(&response) {
                    return Ok((variant, response));
                }
                warn!("Feature flag {flag_key} returned unknown value {response:?}");
            }
            FlagResolution::Pending => {
                info!("Feature flag {flag_key} not resolved yet (attempt {attempt})");
            }
            FlagResolution::Error(message) => {
                error!("Feature flag {flag_key} failed: {message}");
                return Err(SimError::Configuration(format!(
                    "feature flag \"{flag_key}\" failed to load: {message}"
                )));
            }
        }
        if attempt == 1 {
            tokio::time::sleep(retry_delay).await;
        }
    }

    error!("Feature flag {flag_key} not resolved after retry");
    Err(SimError::Configuration(format!(
        "feature flag \"{flag_key}\" did not resolve"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::DisabledAnalytics;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct ScriptedFlags {
        responses: Mutex<Vec<FlagResolution>>,
    }

    impl ScriptedFlags {
        fn new(mut responses: Vec<FlagResolution>) -> Self {
            responses.reverse();
            Self {
                responses: Mutex::new(responses),
            }
        }

        fn remaining(&self) -> usize {
            self.responses.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl FlagSource for ScriptedFlags {
        async fn resolve_flag(&self, _flag_key: &str) -> FlagResolution {
            self.responses
                .lock()
                .unwrap()
                .pop()
                .unwrap_or(FlagResolution::Pending)
        }
    }

    async fn resolve(flags: &ScriptedFlags, store: &DeviceStore) -> Result<Identity> {
        resolve_identity(
            flags,
            &DisabledAnalytics,
            store,
            "word_search_difficulty_v2",
            Duration::from_millis(500),
        )
        .await
    }

    #[tokio::test]
    async fn resolved_flag_persists_identity() {
        let store = DeviceStore::in_memory().unwrap();
        let flags = ScriptedFlags::new(vec![FlagResolution::Resolved("4-words".into())]);

        let identity = resolve(&flags, &store).await.unwrap();
        assert_eq!(identity.variant, Variant::B);
        assert_eq!(identity.flag_response, "4-words");
        assert!(identity.user_id.starts_with("user_"));
        assert_eq!(identity.user_id.len(), 14);

        assert_eq!(
            store.get(USERNAME_KEY).await.unwrap(),
            Some(identity.username.clone())
        );
        assert_eq!(store.get(VARIANT_KEY).await.unwrap().as_deref(), Some("B"));
        assert_eq!(store.get(USER_ID_KEY).await.unwrap(), Some(identity.user_id));
    }

    #[tokio::test(start_paused = true)]
    async fn pending_flag_is_retried_once() {
        let store = DeviceStore::in_memory().unwrap();
        let flags = ScriptedFlags::new(vec![
            FlagResolution::Pending,
            FlagResolution::Resolved("control".into()),
        ]);
        let identity = resolve(&flags, &store).await.unwrap();
        assert_eq!(identity.variant, Variant::A);
        assert_eq!(flags.remaining(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn still_pending_after_retry_is_configuration_error() {
        let store = DeviceStore::in_memory().unwrap();
        let flags = ScriptedFlags::new(vec![
            FlagResolution::Pending,
            FlagResolution::Resolved("unknown-arm".into()),
            FlagResolution::Resolved("control".into()),
        ]);
        store.set(VARIANT_KEY, "B").await.unwrap();
        let err = resolve(&flags, &store).await.unwrap_err();
        assert!(matches!(err, SimError::Configuration(_)));
        assert_eq!(flags.remaining(), 1);
        // The earlier assignment is dropped rather than reused.
        assert_eq!(store.get(VARIANT_KEY).await.unwrap(), None);
    }

    #[tokio::test]
    async fn flag_error_fails_without_retry() {
        let store = DeviceStore::in_memory().unwrap();
        let flags = ScriptedFlags::new(vec![
            FlagResolution::Error("offline".into()),
            FlagResolution::Resolved("control".into()),
        ]);
        assert!(matches!(
            resolve(&flags, &store).await,
            Err(SimError::Configuration(_))
        ));
        assert_eq!(flags.remaining(), 1);
    }

    #[tokio::test]
    async fn existing_username_is_kept_but_user_id_rotates() {
        let store = DeviceStore::in_memory().unwrap();
        store.set(USERNAME_KEY, "Bold Heron").await.unwrap();
        store.set(USER_ID_KEY, "user_previous").await.unwrap();
        let flags = ScriptedFlags::new(vec![FlagResolution::Resolved("control".into())]);

        let identity = resolve(&flags, &store).await.unwrap();
        assert_eq!(identity.username, "Bold Heron");
        assert_ne!(identity.user_id, "user_previous");
    }

    #[tokio::test]
    async fn fixed_variant_resolves_to_its_flag_value() {
        let store = DeviceStore::in_memory().unwrap();
        let identity = resolve_identity(
            &FixedVariant(Variant::B),
            &DisabledAnalytics,
            &store,
            "word_search_difficulty_v2",
            Duration::ZERO,
        )
        .await
        .unwrap();
        assert_eq!(identity.variant, Variant::B);
        assert_eq!(identity.flag_response, "4-words");
    }

    #[test]
    fn generated_names_use_known_words() {
        let name = generate_username();
        let (adjective, animal) = name.split_once(' ').unwrap();
        assert!(ADJECTIVES.contains(&adjective));
        assert!(ANIMALS.contains(&animal));
    }
}
