use serde::{Deserialize, Serialize};
use welltrack_protocol::ItemId;

use crate::status::ItemStatus;
use crate::store::{AnalysisSession, ItemRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ViewFilters {
    pub hide_buffer_zone: bool,
    pub hide_warning: bool,
    pub hide_deviation: bool,
}

impl ViewFilters {
    pub fn allows(&self, status: ItemStatus) -> bool {
        match status {
            ItemStatus::Normal => true,
            ItemStatus::BufferZone => !self.hide_buffer_zone,
            ItemStatus::Warning => !self.hide_warning,
            ItemStatus::Deviation => !self.hide_deviation,
        }
    }
}

/// Plate coordinate parsed from ids such as `A01` or `AB12`.
///
/// Row letters count from `A` = 1 and multi-letter rows are base 26, so
/// `Z` = 26 and `AA` = 27. Ordering is column first, then row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GridPosition {
    pub column: u32,
    pub row: u32,
}

impl GridPosition {
    pub fn parse(id: &str) -> Option<Self> {
        let id = id.trim();
        let split = id
            .find(|character: char| !character.is_ascii_alphabetic())
            .unwrap_or(id.len());
        let (letters, digits) = id.split_at(split);
        if letters.is_empty() || digits.is_empty() || !digits.bytes().all(|byte| byte.is_ascii_digit()) {
            return None;
        }

        let mut row: u32 = 0;
        for letter in letters.bytes() {
            let value = u32::from(letter.to_ascii_uppercase() - b'A') + 1;
            row = row.checked_mul(26)?.checked_add(value)?;
        }
        let column = digits.parse::<u32>().ok()?;
        Some(Self { column, row })
    }
}

/// Orders items column-major and drops those the filters hide.
///
/// Ids that are not plate coordinates go last, in encounter order.
pub fn project(session: &AnalysisSession, filters: &ViewFilters) -> Vec<ItemRecord> {
    let mut positioned = session
        .items
        .iter()
        .enumerate()
        .map(|(encounter, record)| (GridPosition::parse(record.id.as_str()), encounter, record))
        .collect::<Vec<_>>();
    positioned.sort_by_key(|(position, encounter, _)| (position.is_none(), *position, *encounter));

    positioned
        .into_iter()
        .filter(|(_, _, record)| filters.allows(record.status))
        .map(|(_, _, record)| record.clone())
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectedView {
    pub rows: Vec<ItemRecord>,
    pub selected: Option<ItemId>,
}

impl ProjectedView {
    pub fn selected_record(&self) -> Option<&ItemRecord> {
        let selected = self.selected.as_ref()?;
        self.rows.iter().find(|record| &record.id == selected)
    }
}

/// Active filters plus the selected id, carried across recomputations.
#[derive(Debug, Clone, Default)]
pub struct ViewState {
    filters: ViewFilters,
    selected: Option<ItemId>,
}

impl ViewState {
    pub fn filters(&self) -> ViewFilters {
        self.filters
    }

    pub fn set_filters(&mut self, filters: ViewFilters) {
        self.filters = filters;
    }

    pub fn select(&mut self, id: Option<ItemId>) {
        self.selected = id;
    }

    /// Recomputes the view; the selection survives only if its item is
    /// still visible, otherwise it is cleared.
    pub fn project(&mut self, session: &AnalysisSession) -> ProjectedView {
        let rows = project(session, &self.filters);
        if let Some(selected) = &self.selected {
            if !rows.iter().any(|record| &record.id == selected) {
                tracing::debug!(item_id = %selected, "clearing selection hidden by projection");
                self.selected = None;
            }
        }
        ProjectedView {
            rows,
            selected: self.selected.clone(),
        }
    }
}
