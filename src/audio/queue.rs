use std::collections::{HashSet, VecDeque};
use tracing::{debug, info};

use super::track::{TrackIdentity, TrackRef};
use crate::error::ValidationError;

/// Cola FIFO acotada de referencias pendientes.
///
/// Un desborde rechaza el track nuevo; nunca se desaloja uno ya encolado.
#[derive(Debug, Clone)]
pub struct TrackQueue {
    items: VecDeque<TrackRef>,
    max_size: usize,
}

impl TrackQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            items: VecDeque::new(),
            max_size,
        }
    }

    /// Agrega un track al final, devuelve su posición (1-based)
    pub fn push_back(&mut self, track: TrackRef) -> Result<usize, ValidationError> {
        if self.is_full() {
            return Err(ValidationError::QueueFull { max: self.max_size });
        }

        debug!("➕ Agregado a la cola: {}", track);
        self.items.push_back(track);
        Ok(self.items.len())
    }

    /// Inserta un track al frente (back / interlude)
    pub fn push_front(&mut self, track: TrackRef) -> Result<(), ValidationError> {
        if self.is_full() {
            return Err(ValidationError::QueueFull { max: self.max_size });
        }

        debug!("⏫ Insertado al frente de la cola: {}", track);
        self.items.push_front(track);
        Ok(())
    }

    /// Agrega tracks en orden hasta llenar la cola, devuelve cuántos entraron
    pub fn extend_bounded(&mut self, tracks: impl IntoIterator<Item = TrackRef>) -> usize {
        let mut added = 0;
        for track in tracks {
            if self.is_full() {
                break;
            }
            self.items.push_back(track);
            added += 1;
        }
        added
    }

    /// Obtiene el siguiente track (FIFO)
    pub fn pop_front(&mut self) -> Option<TrackRef> {
        self.items.pop_front()
    }

    pub fn front(&self) -> Option<&TrackRef> {
        self.items.front()
    }

    /// Elimina los primeros `count` tracks
    pub fn remove_front(&mut self, count: usize) -> usize {
        let removed = count.min(self.items.len());
        self.items.drain(..removed);

        if removed > 0 {
            info!("🗑️ Eliminadas las primeras {} canciones de la cola", removed);
        }
        removed
    }

    /// Limpia la cola
    pub fn clear(&mut self) -> usize {
        let cleared = self.items.len();
        self.items.clear();
        cleared
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.items.len() >= self.max_size
    }

    pub fn remaining_capacity(&self) -> usize {
        self.max_size.saturating_sub(self.items.len())
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn iter(&self) -> impl Iterator<Item = &TrackRef> {
        self.items.iter()
    }

    pub fn to_vec(&self) -> Vec<TrackRef> {
        self.items.iter().cloned().collect()
    }

    /// Obtiene una página específica de la cola
    pub fn page(&self, page: usize, items_per_page: usize) -> QueuePage {
        let items_per_page = items_per_page.max(1);
        let total_items = self.items.len();
        let total_pages = if total_items == 0 {
            1
        } else {
            total_items.div_ceil(items_per_page)
        };
        let current_page = page.clamp(1, total_pages);
        let start = (current_page - 1) * items_per_page;

        QueuePage {
            items: self
                .items
                .iter()
                .skip(start)
                .take(items_per_page)
                .cloned()
                .collect(),
            first_position: start + 1,
            current_page,
            total_pages,
            total_items,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueuePage {
    pub items: Vec<TrackRef>,
    pub first_position: usize,
    pub current_page: usize,
    pub total_pages: usize,
    pub total_items: usize,
}

/// Historial acotado de tracks ya reproducidos, el más reciente al final.
#[derive(Debug, Clone)]
pub struct PlayHistory {
    items: VecDeque<TrackRef>,
    max_size: usize,
}

impl PlayHistory {
    pub fn new(max_size: usize) -> Self {
        Self {
            items: VecDeque::new(),
            max_size,
        }
    }

    pub fn push(&mut self, track: TrackRef) {
        self.items.push_back(track);

        // Mantener solo los últimos N items
        while self.items.len() > self.max_size {
            self.items.pop_front();
        }
    }

    /// Saca el track reproducido más recientemente
    pub fn pop_latest(&mut self) -> Option<TrackRef> {
        self.items.pop_back()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TrackRef> {
        self.items.iter()
    }

    pub fn to_vec(&self) -> Vec<TrackRef> {
        self.items.iter().cloned().collect()
    }
}

/// Identidades que fallaron al resolverse o reproducirse en esta sesión.
#[derive(Debug, Clone, Default)]
pub struct Blacklist {
    entries: HashSet<TrackIdentity>,
}

impl Blacklist {
    pub fn insert(&mut self, identity: TrackIdentity) -> bool {
        let inserted = self.entries.insert(identity);
        if inserted {
            debug!("🚫 Agregado a la lista negra");
        }
        inserted
    }

    pub fn remove(&mut self, identity: &TrackIdentity) -> bool {
        self.entries.remove(identity)
    }

    pub fn contains(&self, identity: &TrackIdentity) -> bool {
        self.entries.contains(identity)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serenity::model::id::UserId;

    fn track(query: &str) -> TrackRef {
        TrackRef::new(query, UserId::new(1))
    }

    #[test]
    fn test_overflow_rejects_new_item() {
        let mut queue = TrackQueue::new(2);
        assert_eq!(queue.push_back(track("a")), Ok(1));
        assert_eq!(queue.push_back(track("b")), Ok(2));

        assert_eq!(
            queue.push_back(track("c")),
            Err(ValidationError::QueueFull { max: 2 })
        );
        assert_eq!(
            queue.push_front(track("d")),
            Err(ValidationError::QueueFull { max: 2 })
        );
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.front().map(TrackRef::query), Some("a"));
    }

    #[test]
    fn test_extend_bounded_stops_at_capacity() {
        let mut queue = TrackQueue::new(3);
        queue.push_back(track("a")).unwrap();

        let added = queue.extend_bounded(["b", "c", "d", "e"].map(track));

        assert_eq!(added, 2);
        let order: Vec<_> = queue.iter().map(TrackRef::query).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_remove_front_is_bounded_by_len() {
        let mut queue = TrackQueue::new(10);
        queue.extend_bounded(["a", "b", "c"].map(track));

        assert_eq!(queue.remove_front(2), 2);
        assert_eq!(queue.front().map(TrackRef::query), Some("c"));
        assert_eq!(queue.remove_front(5), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_history_evicts_oldest() {
        let mut history = PlayHistory::new(2);
        history.push(track("a"));
        history.push(track("b"));
        history.push(track("c"));

        assert_eq!(history.len(), 2);
        assert_eq!(history.pop_latest().map(|t| t.query().to_string()), Some("c".into()));
        assert_eq!(history.pop_latest().map(|t| t.query().to_string()), Some("b".into()));
        assert!(history.pop_latest().is_none());
    }

    #[test]
    fn test_page_clamps_to_last_page() {
        let mut queue = TrackQueue::new(50);
        queue.extend_bounded((0..12).map(|i| track(&format!("song {}", i))));

        let page = queue.page(9, 5);
        assert_eq!(page.current_page, 3);
        assert_eq!(page.total_pages, 3);
        assert_eq!(page.first_position, 11);
        assert_eq!(page.items.len(), 2);

        let empty = TrackQueue::new(5).page(1, 10);
        assert_eq!(empty.total_pages, 1);
        assert!(empty.items.is_empty());
    }

    #[test]
    fn test_blacklist_matches_normalized_identity() {
        let mut blacklist = Blacklist::default();
        blacklist.insert(track("https://youtu.be/dQw4w9WgXcQ").identity());

        assert!(blacklist.contains(&track("https://www.youtube.com/watch?v=dQw4w9WgXcQ").identity()));
        assert!(blacklist.remove(&track("https://youtube.com/watch?v=dQw4w9WgXcQ").identity()));
        assert!(blacklist.is_empty());
    }
}
