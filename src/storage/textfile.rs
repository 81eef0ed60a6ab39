//! Flat-file key/value tables.
//!
//! Every (adapter, category) pair maps to one file holding `key value` rows,
//! one per line. Readers take a shared `flock` on a sidecar lock file and
//! writers an exclusive one; writers never truncate in place but write the
//! complete new table to a temporary file and rename it over the original.

use std::{
   fs::{self, File, OpenOptions, Permissions},
   io::{self, Write},
   os::{fd::AsRawFd, unix::fs::PermissionsExt},
   path::{Path, PathBuf},
};

use log::debug;
use nix::fcntl::{FlockArg, flock};
use tempfile::NamedTempFile;

use super::{Category, StoreError, StoreResult};
use crate::bluetooth::address::Address;

/// Key comparison policy for a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyMatch {
   Exact,
   IgnoreCase,
}

impl KeyMatch {
   fn matches(self, candidate: &str, key: &str) -> bool {
      match self {
         Self::Exact => candidate == key,
         Self::IgnoreCase => candidate.eq_ignore_ascii_case(key),
      }
   }
}

/// Holds an advisory lock for as long as it lives.
struct LockGuard(File);

impl LockGuard {
   fn acquire(path: &Path, exclusive: bool) -> StoreResult<Self> {
      let file = OpenOptions::new()
         .create(true)
         .truncate(false)
         .read(true)
         .write(true)
         .open(path)?;
      let arg = if exclusive {
         FlockArg::LockExclusive
      } else {
         FlockArg::LockShared
      };
      flock(file.as_raw_fd(), arg).map_err(|e| StoreError::Io(io::Error::from(e)))?;
      Ok(Self(file))
   }
}

impl Drop for LockGuard {
   fn drop(&mut self) {
      let _ = flock(self.0.as_raw_fd(), FlockArg::Unlock);
   }
}

/// One parsed row of a table.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Row {
   key: String,
   value: String,
}

fn parse_rows(text: &str) -> Vec<Row> {
   text
      .lines()
      .filter(|line| !line.is_empty())
      .map(|line| match line.split_once(' ') {
         Some((key, value)) => Row {
            key: key.to_string(),
            value: value.to_string(),
         },
         None => Row {
            key: line.to_string(),
            value: String::new(),
         },
      })
      .collect()
}

fn render_rows(rows: &[Row]) -> String {
   let mut out = String::new();
   for row in rows {
      out.push_str(&row.key);
      out.push(' ');
      out.push_str(&row.value);
      out.push('\n');
   }
   out
}

fn check_key(key: &str) -> StoreResult<()> {
   if key.is_empty() || key.contains([' ', '\n']) {
      return Err(StoreError::InvalidInput("key must be non-empty without whitespace"));
   }
   Ok(())
}

fn check_value(value: &str) -> StoreResult<()> {
   if value.contains(['\n', '\r']) {
      return Err(StoreError::InvalidInput("value must be a single line"));
   }
   Ok(())
}

/// Flat-file table store rooted at a storage directory.
#[derive(Debug, Clone)]
pub struct TextStore {
   root: PathBuf,
}

impl TextStore {
   pub fn new(root: impl Into<PathBuf>) -> Self {
      Self { root: root.into() }
   }

   pub fn root(&self) -> &Path {
      &self.root
   }

   /// Path of the table for `(adapter, category)`.
   pub fn table_path(&self, adapter: &Address, category: Category) -> PathBuf {
      self.root.join(adapter.to_string()).join(category.as_ref())
   }

   fn lock_path(&self, adapter: &Address, category: Category) -> PathBuf {
      self
         .root
         .join(adapter.to_string())
         .join(format!(".{}.lock", category.as_ref()))
   }

   fn read_rows(path: &Path) -> StoreResult<Vec<Row>> {
      match fs::read(path) {
         Ok(bytes) => Ok(parse_rows(&String::from_utf8_lossy(&bytes))),
         Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StoreError::NotFound),
         Err(e) => Err(e.into()),
      }
   }

   /// Replaces the table with `rows` using write-new-then-rename.
   fn commit(path: &Path, rows: &[Row], mode: u32) -> StoreResult<()> {
      let dir = path
         .parent()
         .ok_or(StoreError::InvalidInput("table path has no parent"))?;
      let mut tmp = NamedTempFile::new_in(dir)?;
      tmp.write_all(render_rows(rows).as_bytes())?;
      tmp.as_file().sync_all()?;
      tmp.as_file().set_permissions(Permissions::from_mode(mode))?;
      tmp.persist(path).map_err(|e| StoreError::Io(e.error))?;
      Ok(())
   }

   fn ensure_dir(&self, adapter: &Address) -> StoreResult<()> {
      let dir = self.root.join(adapter.to_string());
      if !dir.exists() {
         fs::create_dir_all(&dir)?;
         fs::set_permissions(&dir, Permissions::from_mode(0o755))?;
      }
      Ok(())
   }

   fn lookup(
      &self,
      adapter: &Address,
      category: Category,
      key: &str,
      policy: KeyMatch,
   ) -> StoreResult<String> {
      let path = self.table_path(adapter, category);
      if !path.exists() {
         return Err(StoreError::NotFound);
      }
      let _lock = LockGuard::acquire(&self.lock_path(adapter, category), false)?;
      Self::read_rows(&path)?
         .into_iter()
         .find(|row| policy.matches(&row.key, key))
         .map(|row| row.value)
         .ok_or(StoreError::NotFound)
   }

   fn store(
      &self,
      adapter: &Address,
      category: Category,
      key: &str,
      value: &str,
      policy: KeyMatch,
   ) -> StoreResult<()> {
      check_key(key)?;
      check_value(value)?;
      self.ensure_dir(adapter)?;

      let path = self.table_path(adapter, category);
      let _lock = LockGuard::acquire(&self.lock_path(adapter, category), true)?;
      let mut rows = match Self::read_rows(&path) {
         Ok(rows) => rows,
         Err(StoreError::NotFound) => Vec::new(),
         Err(e) => return Err(e),
      };

      if let Some(row) = rows.iter_mut().find(|row| policy.matches(&row.key, key)) {
         if row.value == value {
            return Ok(());
         }
         row.value = value.to_string();
      } else {
         rows.push(Row {
            key: key.to_string(),
            value: value.to_string(),
         });
      }

      debug!("{}: put {key}", path.display());
      Self::commit(&path, &rows, category.mode())
   }

   fn remove(
      &self,
      adapter: &Address,
      category: Category,
      key: &str,
      policy: KeyMatch,
   ) -> StoreResult<()> {
      let path = self.table_path(adapter, category);
      if !path.exists() {
         return Err(StoreError::NotFound);
      }
      let _lock = LockGuard::acquire(&self.lock_path(adapter, category), true)?;
      let mut rows = Self::read_rows(&path)?;
      let before = rows.len();
      rows.retain(|row| !policy.matches(&row.key, key));
      if rows.len() == before {
         return Err(StoreError::NotFound);
      }

      debug!("{}: del {key}", path.display());
      Self::commit(&path, &rows, category.mode())
   }

   pub fn get(&self, adapter: &Address, category: Category, key: &str) -> StoreResult<String> {
      self.lookup(adapter, category, key, KeyMatch::Exact)
   }

   pub fn get_nocase(
      &self,
      adapter: &Address,
      category: Category,
      key: &str,
   ) -> StoreResult<String> {
      self.lookup(adapter, category, key, KeyMatch::IgnoreCase)
   }

   pub fn put(
      &self,
      adapter: &Address,
      category: Category,
      key: &str,
      value: &str,
   ) -> StoreResult<()> {
      self.store(adapter, category, key, value, KeyMatch::Exact)
   }

   pub fn put_nocase(
      &self,
      adapter: &Address,
      category: Category,
      key: &str,
      value: &str,
   ) -> StoreResult<()> {
      self.store(adapter, category, key, value, KeyMatch::IgnoreCase)
   }

   pub fn delete(&self, adapter: &Address, category: Category, key: &str) -> StoreResult<()> {
      self.remove(adapter, category, key, KeyMatch::Exact)
   }

   pub fn delete_nocase(
      &self,
      adapter: &Address,
      category: Category,
      key: &str,
   ) -> StoreResult<()> {
      self.remove(adapter, category, key, KeyMatch::IgnoreCase)
   }

   /// Deletes every row whose key satisfies `pred` and returns how many went.
   pub fn delete_where(
      &self,
      adapter: &Address,
      category: Category,
      mut pred: impl FnMut(&str) -> bool,
   ) -> StoreResult<usize> {
      let path = self.table_path(adapter, category);
      if !path.exists() {
         return Err(StoreError::NotFound);
      }
      let _lock = LockGuard::acquire(&self.lock_path(adapter, category), true)?;
      let mut rows = Self::read_rows(&path)?;
      let before = rows.len();
      rows.retain(|row| !pred(&row.key));
      let removed = before - rows.len();
      if removed > 0 {
         Self::commit(&path, &rows, category.mode())?;
      }
      Ok(removed)
   }

   /// Visits every row of a table in file order.
   pub fn for_each(
      &self,
      adapter: &Address,
      category: Category,
      mut visitor: impl FnMut(&str, &str),
   ) -> StoreResult<()> {
      let path = self.table_path(adapter, category);
      if !path.exists() {
         return Err(StoreError::NotFound);
      }
      let _lock = LockGuard::acquire(&self.lock_path(adapter, category), false)?;
      for row in Self::read_rows(&path)? {
         visitor(&row.key, &row.value);
      }
      Ok(())
   }
}

#[cfg(test)]
mod tests {
   use std::os::unix::fs::MetadataExt;

   use tempfile::TempDir;

   use super::*;

   const ADAPTER: Address = Address([0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);

   fn create_store() -> (TextStore, TempDir) {
      let dir = TempDir::new().unwrap();
      (TextStore::new(dir.path()), dir)
   }

   #[test]
   fn test_missing_table_is_not_found() {
      let (store, _dir) = create_store();
      assert!(matches!(
         store.get(&ADAPTER, Category::Names, "AA:BB:CC:DD:EE:FF"),
         Err(StoreError::NotFound)
      ));
      assert!(matches!(
         store.delete(&ADAPTER, Category::Names, "AA:BB:CC:DD:EE:FF"),
         Err(StoreError::NotFound)
      ));
      assert!(matches!(
         store.for_each(&ADAPTER, Category::Names, |_, _| {}),
         Err(StoreError::NotFound)
      ));
   }

   #[test]
   fn test_put_get_replace_delete() {
      let (store, _dir) = create_store();
      let key = "AA:BB:CC:DD:EE:FF";

      store.put(&ADAPTER, Category::Names, key, "first name").unwrap();
      store
         .put(&ADAPTER, Category::Names, "11:22:33:44:55:66", "other")
         .unwrap();
      store.put(&ADAPTER, Category::Names, key, "second name").unwrap();

      assert_eq!(store.get(&ADAPTER, Category::Names, key).unwrap(), "second name");

      let mut rows = Vec::new();
      store
         .for_each(&ADAPTER, Category::Names, |k, v| rows.push((k.to_string(), v.to_string())))
         .unwrap();
      assert_eq!(rows.len(), 2);
      assert_eq!(rows[0], (key.to_string(), "second name".to_string()));

      store.delete(&ADAPTER, Category::Names, key).unwrap();
      assert!(matches!(
         store.get(&ADAPTER, Category::Names, key),
         Err(StoreError::NotFound)
      ));
      assert_eq!(
         store.get(&ADAPTER, Category::Names, "11:22:33:44:55:66").unwrap(),
         "other"
      );
   }

   #[test]
   fn test_case_policies() {
      let (store, _dir) = create_store();
      store
         .put_nocase(&ADAPTER, Category::Trusts, "aa:bb:cc:dd:ee:ff", "[all]")
         .unwrap();

      assert!(store.get(&ADAPTER, Category::Trusts, "AA:BB:CC:DD:EE:FF").is_err());
      assert_eq!(
         store
            .get_nocase(&ADAPTER, Category::Trusts, "AA:BB:CC:DD:EE:FF")
            .unwrap(),
         "[all]"
      );

      store
         .put_nocase(&ADAPTER, Category::Trusts, "AA:BB:CC:DD:EE:FF", "hfp")
         .unwrap();
      let mut count = 0;
      store.for_each(&ADAPTER, Category::Trusts, |_, _| count += 1).unwrap();
      assert_eq!(count, 1);

      store
         .delete_nocase(&ADAPTER, Category::Trusts, "AA:bb:CC:dd:EE:ff")
         .unwrap();
      assert!(store.get_nocase(&ADAPTER, Category::Trusts, "aa:bb:cc:dd:ee:ff").is_err());
   }

   #[test]
   fn test_empty_value_round_trips() {
      let (store, _dir) = create_store();
      store
         .put_nocase(&ADAPTER, Category::Blocked, "AA:BB:CC:DD:EE:FF", "")
         .unwrap();
      assert_eq!(
         store
            .get_nocase(&ADAPTER, Category::Blocked, "AA:BB:CC:DD:EE:FF")
            .unwrap(),
         ""
      );
   }

   #[test]
   fn test_rejects_bad_keys_and_values() {
      let (store, _dir) = create_store();
      assert!(matches!(
         store.put(&ADAPTER, Category::Names, "", "x"),
         Err(StoreError::InvalidInput(_))
      ));
      assert!(matches!(
         store.put(&ADAPTER, Category::Names, "a b", "x"),
         Err(StoreError::InvalidInput(_))
      ));
      assert!(matches!(
         store.put(&ADAPTER, Category::Names, "AA:BB:CC:DD:EE:FF", "x\ny"),
         Err(StoreError::InvalidInput(_))
      ));
   }

   #[test]
   fn test_file_permissions_by_category() {
      let (store, _dir) = create_store();
      store
         .put(&ADAPTER, Category::LinkKeys, "AA:BB:CC:DD:EE:FF", "00 0 4")
         .unwrap();
      store
         .put(&ADAPTER, Category::Names, "AA:BB:CC:DD:EE:FF", "name")
         .unwrap();

      let keys = fs::metadata(store.table_path(&ADAPTER, Category::LinkKeys)).unwrap();
      let names = fs::metadata(store.table_path(&ADAPTER, Category::Names)).unwrap();
      assert_eq!(keys.mode() & 0o777, 0o600);
      assert_eq!(names.mode() & 0o777, 0o644);
   }

   #[test]
   fn test_interrupted_write_keeps_previous_value() {
      let (store, _dir) = create_store();
      let key = "AA:BB:CC:DD:EE:FF";
      store.put(&ADAPTER, Category::Names, key, "stable").unwrap();

      // A writer that died after writing its temporary file but before the
      // rename leaves a stray file next to the table and nothing else.
      let table = store.table_path(&ADAPTER, Category::Names);
      let mut partial = NamedTempFile::new_in(table.parent().unwrap()).unwrap();
      partial.write_all(b"AA:BB:CC:DD:EE:FF tru").unwrap();
      let (_file, _stray) = partial.keep().unwrap();

      assert_eq!(store.get(&ADAPTER, Category::Names, key).unwrap(), "stable");
   }

   #[test]
   fn test_delete_where_prefix() {
      let (store, _dir) = create_store();
      let peer: Address = "AA:BB:CC:DD:EE:FF".parse().unwrap();
      store
         .put(&ADAPTER, Category::Attributes, "AA:BB:CC:DD:EE:FF#0001", "a")
         .unwrap();
      store
         .put(&ADAPTER, Category::Attributes, "aa:bb:cc:dd:ee:ff#0002", "b")
         .unwrap();
      store
         .put(&ADAPTER, Category::Attributes, "11:22:33:44:55:66#0001", "c")
         .unwrap();

      let removed = store
         .delete_where(&ADAPTER, Category::Attributes, |k| peer.prefixes(k))
         .unwrap();
      assert_eq!(removed, 2);

      let mut left = Vec::new();
      store
         .for_each(&ADAPTER, Category::Attributes, |k, _| left.push(k.to_string()))
         .unwrap();
      assert_eq!(left, vec!["11:22:33:44:55:66#0001".to_string()]);
   }
}
