use dashmap::{mapref::entry::Entry, DashMap};
use parking_lot::{Mutex, MutexGuard};
use serenity::model::id::GuildId;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::orchestrator::Envelope;
use super::session::GuildSession;
use crate::config::PlaybackConfig;
use crate::error::CommandError;

/// Todo lo que existe por guild: la sesión, su canal de triggers y el token
/// que apaga su worker.
pub struct GuildSlot {
    guild_id: GuildId,
    session: Mutex<GuildSession>,
    triggers: flume::Sender<Envelope>,
    receiver: Mutex<Option<flume::Receiver<Envelope>>>,
    shutdown: CancellationToken,
}

impl GuildSlot {
    fn new(guild_id: GuildId, config: PlaybackConfig, shutdown: CancellationToken) -> Self {
        let (triggers, receiver) = flume::unbounded();
        Self {
            guild_id,
            session: Mutex::new(GuildSession::new(guild_id, config)),
            triggers,
            receiver: Mutex::new(Some(receiver)),
            shutdown,
        }
    }

    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    /// El lock solo se toma para pasos síncronos; nunca a través de un `.await`.
    pub(crate) fn session(&self) -> MutexGuard<'_, GuildSession> {
        self.session.lock()
    }

    pub(crate) fn sender(&self) -> &flume::Sender<Envelope> {
        &self.triggers
    }

    /// El receptor se entrega una sola vez, al worker del slot.
    pub(crate) fn take_receiver(&self) -> Option<flume::Receiver<Envelope>> {
        self.receiver.lock().take()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn pending_triggers(&self) -> usize {
        self.triggers.len()
    }
}

impl std::fmt::Debug for GuildSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuildSlot")
            .field("guild_id", &self.guild_id)
            .field("pending_triggers", &self.triggers.len())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Único dueño de las sesiones: una por guild, creada y destruida acá.
pub struct SessionRegistry {
    slots: DashMap<GuildId, Arc<GuildSlot>>,
    config: PlaybackConfig,
    shutdown: CancellationToken,
}

impl SessionRegistry {
    pub fn new(config: PlaybackConfig) -> Self {
        Self {
            slots: DashMap::new(),
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Devuelve el slot del guild, creándolo si no existe.
    ///
    /// El segundo valor es `true` solo para quien lo creó.
    pub fn get_or_create(&self, guild_id: GuildId) -> (Arc<GuildSlot>, bool) {
        match self.slots.entry(guild_id) {
            Entry::Occupied(entry) => (entry.get().clone(), false),
            Entry::Vacant(entry) => {
                let slot = Arc::new(GuildSlot::new(
                    guild_id,
                    self.config,
                    self.shutdown.child_token(),
                ));
                entry.insert(slot.clone());
                info!("🆕 Sesión creada para guild {}", guild_id);
                (slot, true)
            }
        }
    }

    pub fn get(&self, guild_id: GuildId) -> Option<Arc<GuildSlot>> {
        self.slots.get(&guild_id).map(|slot| slot.clone())
    }

    /// Elimina la sesión solo si está inactiva; si no, `SessionBusy`.
    pub fn remove(&self, guild_id: GuildId) -> Result<(), CommandError> {
        self.remove_where(guild_id, |_| true)
    }

    /// Como [`remove`](Self::remove), pero solo si el slot registrado sigue
    /// siendo `slot` (un worker viejo no puede borrar una sesión nueva).
    pub(crate) fn release(&self, slot: &Arc<GuildSlot>) -> Result<(), CommandError> {
        self.remove_where(slot.guild_id(), |current| Arc::ptr_eq(current, slot))
    }

    fn remove_where(
        &self,
        guild_id: GuildId,
        matches: impl FnOnce(&Arc<GuildSlot>) -> bool,
    ) -> Result<(), CommandError> {
        let Entry::Occupied(entry) = self.slots.entry(guild_id) else {
            return Ok(());
        };
        if !matches(entry.get()) {
            debug!("Slot de guild {} ya fue reemplazado", guild_id);
            return Ok(());
        }
        if !entry.get().session().is_idle() {
            return Err(CommandError::SessionBusy("la sesión tiene reproducción en curso"));
        }

        let slot = entry.remove();
        slot.shutdown.cancel();
        info!("🧹 Sesión eliminada para guild {}", guild_id);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn guild_ids(&self) -> Vec<GuildId> {
        self.slots.iter().map(|entry| *entry.key()).collect()
    }

    /// Apaga todos los workers; las sesiones quedan en el mapa.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::events::{Command, Trigger};
    use crate::audio::track::TrackRef;
    use chrono::Utc;
    use serenity::model::id::UserId;

    #[test]
    fn test_get_or_create_is_idempotent() {
        let registry = SessionRegistry::new(PlaybackConfig::default());
        let guild = GuildId::new(1);

        let (first, created) = registry.get_or_create(guild);
        assert!(created);
        let (second, created) = registry.get_or_create(guild);
        assert!(!created);

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
        assert!(first.take_receiver().is_some());
        assert!(second.take_receiver().is_none());
    }

    #[test]
    fn test_concurrent_creation_yields_one_session() {
        let registry = SessionRegistry::new(PlaybackConfig::default());
        let guild = GuildId::new(77);

        let slots: Vec<(Arc<GuildSlot>, bool)> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..16)
                .map(|_| scope.spawn(|| registry.get_or_create(guild)))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(slots.iter().filter(|(_, created)| *created).count(), 1);
        assert!(slots.windows(2).all(|w| Arc::ptr_eq(&w[0].0, &w[1].0)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_refuses_busy_session() {
        let registry = SessionRegistry::new(PlaybackConfig::default());
        let guild = GuildId::new(5);
        let (slot, _) = registry.get_or_create(guild);

        slot.session().handle(
            Trigger::Command(Command::Enqueue(TrackRef::new("a", UserId::new(1)))),
            Utc::now(),
        );
        assert!(matches!(
            registry.remove(guild),
            Err(CommandError::SessionBusy(_))
        ));
        assert!(!slot.is_closed());

        slot.session()
            .handle(Trigger::Command(Command::ClearAll), Utc::now());
        assert_eq!(registry.remove(guild), Ok(()));
        assert!(slot.is_closed());
        assert!(registry.get(guild).is_none());

        // Un guild desconocido no es error
        assert_eq!(registry.remove(GuildId::new(404)), Ok(()));
    }

    #[test]
    fn test_stale_slot_cannot_release_new_one() {
        let registry = SessionRegistry::new(PlaybackConfig::default());
        let guild = GuildId::new(9);
        let (old, _) = registry.get_or_create(guild);
        registry.remove(guild).unwrap();

        let (new, created) = registry.get_or_create(guild);
        assert!(created);
        assert_eq!(registry.release(&old), Ok(()));
        assert!(registry.get(guild).is_some());
        assert!(!new.is_closed());
    }

    #[test]
    fn test_shutdown_cancels_every_slot() {
        let registry = SessionRegistry::new(PlaybackConfig::default());
        let (a, _) = registry.get_or_create(GuildId::new(1));
        let (b, _) = registry.get_or_create(GuildId::new(2));

        registry.shutdown();
        assert!(a.is_closed() && b.is_closed());
        assert_eq!(registry.guild_ids().len(), 2);
    }
}
