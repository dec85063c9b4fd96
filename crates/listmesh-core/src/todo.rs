//! Todo-list operations on top of the document store
//!
//! Lists and tasks are plain rows; deleting a task copies its title,
//! description and progress into the `cemetery` table (keyed by the task id)
//! before the task row is removed.

use chrono::Utc;
use uuid::Uuid;

use crate::error::StoreError;
use crate::schema::{tables, values, CellValue, Row};
use crate::store::DocumentStore;

/// Reason recorded when a task goes down with its list
pub const LIST_DELETED_REASON: &str = "list deleted";

fn now_millis() -> f64 {
    Utc::now().timestamp_millis() as f64
}

fn text(row: &Row, column: &str) -> String {
    row.get(column)
        .and_then(CellValue::as_str)
        .unwrap_or_default()
        .to_string()
}

fn number(row: &Row, column: &str) -> f64 {
    row.get(column).and_then(CellValue::as_f64).unwrap_or_default()
}

/// A todo list
#[derive(Debug, Clone, PartialEq)]
pub struct TodoList {
    pub id: String,
    pub title: String,
    pub emoji: String,
    pub color: String,
    pub created_at: f64,
}

impl TodoList {
    fn from_row(id: &str, row: &Row) -> Self {
        Self {
            id: id.to_string(),
            title: text(row, "title"),
            emoji: text(row, "emoji"),
            color: text(row, "color"),
            created_at: number(row, "createdAt"),
        }
    }
}

/// A task belonging to a list
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub id: String,
    pub list_id: String,
    pub title: String,
    pub description: String,
    pub progress: f64,
    pub completed: bool,
    pub created_at: f64,
    pub updated_at: f64,
}

impl Task {
    fn from_row(id: &str, row: &Row) -> Self {
        Self {
            id: id.to_string(),
            list_id: text(row, "listId"),
            title: text(row, "title"),
            description: text(row, "description"),
            progress: number(row, "progress"),
            completed: row
                .get("completed")
                .and_then(CellValue::as_bool)
                .unwrap_or(false),
            created_at: number(row, "createdAt"),
            updated_at: number(row, "updatedAt"),
        }
    }
}

/// Tombstone left behind by a deleted task
#[derive(Debug, Clone, PartialEq)]
pub struct Grave {
    pub id: String,
    pub original_title: String,
    pub original_description: String,
    pub original_progress: f64,
    pub deleted_at: f64,
    pub deletion_reason: String,
}

impl Grave {
    fn from_row(id: &str, row: &Row) -> Self {
        Self {
            id: id.to_string(),
            original_title: text(row, "originalTitle"),
            original_description: text(row, "originalDescription"),
            original_progress: number(row, "originalProgress"),
            deleted_at: number(row, "deletedAt"),
            deletion_reason: text(row, "deletionReason"),
        }
    }
}

/// Fields of a task to change; `None` leaves the cell alone
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
    pub progress: Option<f64>,
    pub completed: Option<bool>,
}

// ==================== Lists ====================

/// Create a list and return its id
pub fn create_list(
    store: &mut DocumentStore,
    title: &str,
    emoji: Option<&str>,
    color: Option<&str>,
) -> Result<String, StoreError> {
    let id = Uuid::new_v4().to_string();
    let mut row = Row::new();
    row.insert("id".into(), id.clone().into());
    row.insert("title".into(), title.into());
    if let Some(emoji) = emoji {
        row.insert("emoji".into(), emoji.into());
    }
    if let Some(color) = color {
        row.insert("color".into(), color.into());
    }
    row.insert("createdAt".into(), now_millis().into());

    store.set_row(tables::LISTS, &id, row)?;
    Ok(id)
}

pub fn rename_list(store: &mut DocumentStore, list_id: &str, title: &str) -> Result<bool, StoreError> {
    if !store.has_row(tables::LISTS, list_id) {
        return Ok(false);
    }
    store.set_cell(tables::LISTS, list_id, "title", title)?;
    Ok(true)
}

pub fn get_list(store: &DocumentStore, list_id: &str) -> Option<TodoList> {
    store
        .get_row(tables::LISTS, list_id)
        .map(|row| TodoList::from_row(list_id, &row))
}

/// All lists, oldest first
pub fn lists(store: &DocumentStore) -> Vec<TodoList> {
    let mut lists: Vec<TodoList> = store
        .get_table(tables::LISTS)
        .iter()
        .map(|(id, row)| TodoList::from_row(id, row))
        .collect();
    lists.sort_by(|a, b| a.created_at.total_cmp(&b.created_at));
    lists
}

/// Delete a list, burying each of its tasks first
pub fn delete_list(store: &mut DocumentStore, list_id: &str) -> Result<bool, StoreError> {
    if !store.has_row(tables::LISTS, list_id) {
        return Ok(false);
    }
    for task_id in tasks_in_list(store, list_id) {
        delete_task(store, &task_id, LIST_DELETED_REASON)?;
    }
    store.del_row(tables::LISTS, list_id)
}

// ==================== Tasks ====================

/// Create a task in a list and return its id
pub fn create_task(
    store: &mut DocumentStore,
    list_id: &str,
    title: &str,
    description: &str,
) -> Result<String, StoreError> {
    let id = Uuid::new_v4().to_string();
    let now = now_millis();
    let mut row = Row::new();
    row.insert("id".into(), id.clone().into());
    row.insert("listId".into(), list_id.into());
    row.insert("title".into(), title.into());
    row.insert("description".into(), description.into());
    row.insert("createdAt".into(), now.into());
    row.insert("updatedAt".into(), now.into());

    store.set_row(tables::TASKS, &id, row)?;
    Ok(id)
}

pub fn get_task(store: &DocumentStore, task_id: &str) -> Option<Task> {
    store
        .get_row(tables::TASKS, task_id)
        .map(|row| Task::from_row(task_id, &row))
}

/// Ids of the tasks whose `listId` points at `list_id`
pub fn tasks_in_list(store: &DocumentStore, list_id: &str) -> Vec<String> {
    store
        .get_table(tables::TASKS)
        .into_iter()
        .filter(|(_, row)| row.get("listId").and_then(CellValue::as_str) == Some(list_id))
        .map(|(id, _)| id)
        .collect()
}

/// Apply a partial update to a task. Returns `false` if the task is gone.
pub fn update_task(
    store: &mut DocumentStore,
    task_id: &str,
    update: TaskUpdate,
) -> Result<bool, StoreError> {
    if !store.has_row(tables::TASKS, task_id) {
        return Ok(false);
    }

    let mut row = Row::new();
    if let Some(title) = update.title {
        row.insert("title".into(), title.into());
    }
    if let Some(description) = update.description {
        row.insert("description".into(), description.into());
    }
    if let Some(progress) = update.progress {
        row.insert("progress".into(), progress.into());
    }
    if let Some(completed) = update.completed {
        row.insert("completed".into(), completed.into());
    }
    row.insert("updatedAt".into(), now_millis().into());

    store.set_partial_row(tables::TASKS, task_id, row)?;
    Ok(true)
}

/// Set progress (clamped to 0–100); reaching 100 marks the task completed
pub fn set_task_progress(
    store: &mut DocumentStore,
    task_id: &str,
    progress: f64,
) -> Result<bool, StoreError> {
    let progress = progress.clamp(0.0, 100.0);
    update_task(
        store,
        task_id,
        TaskUpdate {
            progress: Some(progress),
            completed: Some(progress >= 100.0),
            ..Default::default()
        },
    )
}

/// Move a task to the cemetery.
///
/// Returns `false` and writes nothing if the task does not exist, so
/// deleting twice leaves exactly one grave.
pub fn delete_task(
    store: &mut DocumentStore,
    task_id: &str,
    reason: &str,
) -> Result<bool, StoreError> {
    let Some(task) = get_task(store, task_id) else {
        return Ok(false);
    };

    let mut grave = Row::new();
    grave.insert("id".into(), task_id.into());
    grave.insert("originalTitle".into(), task.title.into());
    grave.insert("originalDescription".into(), task.description.into());
    grave.insert("originalProgress".into(), task.progress.into());
    grave.insert("deletedAt".into(), now_millis().into());
    grave.insert("deletionReason".into(), reason.into());

    store.set_row(tables::CEMETERY, task_id, grave)?;
    store.del_row(tables::TASKS, task_id)
}

pub fn get_grave(store: &DocumentStore, task_id: &str) -> Option<Grave> {
    store
        .get_row(tables::CEMETERY, task_id)
        .map(|row| Grave::from_row(task_id, &row))
}

/// Graves, most recently deleted first
pub fn cemetery(store: &DocumentStore) -> Vec<Grave> {
    let mut graves: Vec<Grave> = store
        .get_table(tables::CEMETERY)
        .iter()
        .map(|(id, row)| Grave::from_row(id, row))
        .collect();
    graves.sort_by(|a, b| b.deleted_at.total_cmp(&a.deleted_at));
    graves
}

/// Bring a buried task back into `list_id`. The grave stays as audit trail.
pub fn restore_task(
    store: &mut DocumentStore,
    task_id: &str,
    list_id: &str,
) -> Result<bool, StoreError> {
    if store.has_row(tables::TASKS, task_id) {
        return Ok(false);
    }
    let Some(grave) = get_grave(store, task_id) else {
        return Ok(false);
    };

    let now = now_millis();
    let mut row = Row::new();
    row.insert("id".into(), task_id.into());
    row.insert("listId".into(), list_id.into());
    row.insert("title".into(), grave.original_title.into());
    row.insert("description".into(), grave.original_description.into());
    row.insert("progress".into(), grave.original_progress.into());
    row.insert("completed".into(), (grave.original_progress >= 100.0).into());
    row.insert("createdAt".into(), now.into());
    row.insert("updatedAt".into(), now.into());

    store.set_row(tables::TASKS, task_id, row)?;
    Ok(true)
}

// ==================== Values ====================

/// Record which device and user this replica belongs to
pub fn set_device_identity(
    store: &mut DocumentStore,
    device_id: &str,
    user_id: &str,
) -> Result<(), StoreError> {
    store.set_value(values::DEVICE_ID, device_id)?;
    store.set_value(values::USER_ID, user_id)
}

/// Stamp the time of the last completed sync
pub fn mark_synced(store: &mut DocumentStore) -> Result<(), StoreError> {
    store.set_value(values::LAST_SYNC, now_millis())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_task() -> (DocumentStore, String, String) {
        let mut store = DocumentStore::todo("a");
        let list = create_list(&mut store, "Groceries", Some("🛒"), None).unwrap();
        let task = create_task(&mut store, &list, "Milk", "oat").unwrap();
        (store, list, task)
    }

    #[test]
    fn test_create_list_and_task() {
        let (store, list, task) = store_with_task();
        let l = get_list(&store, &list).unwrap();
        assert_eq!(l.title, "Groceries");
        assert_eq!(l.emoji, "🛒");
        assert_eq!(l.color, "#3b82f6");

        let t = get_task(&store, &task).unwrap();
        assert_eq!(t.list_id, list);
        assert_eq!(t.progress, 0.0);
        assert!(!t.completed);
        assert_eq!(tasks_in_list(&store, &list), vec![task]);
    }

    #[test]
    fn test_progress_is_clamped_and_completes() {
        let (mut store, _, task) = store_with_task();
        assert!(set_task_progress(&mut store, &task, 250.0).unwrap());
        let t = get_task(&store, &task).unwrap();
        assert_eq!(t.progress, 100.0);
        assert!(t.completed);
        assert!(!set_task_progress(&mut store, "missing", 10.0).unwrap());
    }

    #[test]
    fn test_delete_task_moves_to_cemetery_once() {
        let (mut store, _, task) = store_with_task();
        set_task_progress(&mut store, &task, 40.0).unwrap();

        assert!(delete_task(&mut store, &task, "done with it").unwrap());
        assert!(get_task(&store, &task).is_none());

        let grave = get_grave(&store, &task).unwrap();
        assert_eq!(grave.original_title, "Milk");
        assert_eq!(grave.original_description, "oat");
        assert_eq!(grave.original_progress, 40.0);
        assert_eq!(grave.deletion_reason, "done with it");

        assert!(!delete_task(&mut store, &task, "again").unwrap());
        assert_eq!(cemetery(&store).len(), 1);
        assert_eq!(get_grave(&store, &task).unwrap().deletion_reason, "done with it");
    }

    #[test]
    fn test_delete_list_buries_its_tasks() {
        let (mut store, list, task) = store_with_task();
        let other = create_list(&mut store, "Work", None, None).unwrap();
        let kept = create_task(&mut store, &other, "Report", "").unwrap();

        assert!(delete_list(&mut store, &list).unwrap());
        assert!(get_list(&store, &list).is_none());
        assert!(get_task(&store, &task).is_none());
        assert_eq!(get_grave(&store, &task).unwrap().deletion_reason, LIST_DELETED_REASON);
        assert!(get_task(&store, &kept).is_some());
        assert_eq!(lists(&store).len(), 1);
    }

    #[test]
    fn test_concurrent_progress_does_not_revive_deleted_task() {
        let (mut phone, _, task) = store_with_task();
        let mut laptop = DocumentStore::todo("b");
        laptop.merge_with(&phone.snapshot());

        assert!(delete_task(&mut phone, &task, "done").unwrap());
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(set_task_progress(&mut laptop, &task, 30.0).unwrap());

        let from_phone = phone.snapshot();
        let from_laptop = laptop.snapshot();
        phone.merge_with(&from_laptop);
        laptop.merge_with(&from_phone);

        assert!(phone.same_state(&laptop));
        for store in [&phone, &laptop] {
            assert!(get_task(store, &task).is_none());
            assert_eq!(get_grave(store, &task).unwrap().original_title, "Milk");
            assert!(store.get_table(tables::TASKS).is_empty());
        }
    }

    #[test]
    fn test_restore_task_from_cemetery() {
        let (mut store, list, task) = store_with_task();
        delete_task(&mut store, &task, "oops").unwrap();
        assert!(restore_task(&mut store, &task, &list).unwrap());
        assert_eq!(get_task(&store, &task).unwrap().title, "Milk");
        assert!(!restore_task(&mut store, &task, &list).unwrap());
    }

    #[test]
    fn test_device_identity_values() {
        let mut store = DocumentStore::todo("a");
        set_device_identity(&mut store, "phone", "0123456789abcdef").unwrap();
        mark_synced(&mut store).unwrap();
        assert_eq!(store.get_value(values::DEVICE_ID), Some("phone".into()));
        assert!(store.get_value(values::LAST_SYNC).is_some());
    }
}
