use crate::change::ListChange;

/// The scoped updater passed to [`crate::list::SourceList::edit`] (§4.2).
///
/// `move_item`'s `to` argument is the index the item occupies in the
/// *resulting* list — i.e. the edit is exactly "remove at `from`, then
/// insert at `to`" — matching the structural "identity preserved, index
/// change only" semantics spec.md calls for.
pub struct ListEditor<'a, T> {
    pub(crate) data: &'a mut Vec<T>,
    pub(crate) records: &'a mut Vec<ListChange<T>>,
}

impl<'a, T: Clone> ListEditor<'a, T> {
    pub fn add(&mut self, item: T) {
        let index = self.data.len();
        self.data.push(item.clone());
        self.records.push(ListChange::Add { index, item });
    }

    pub fn add_range(&mut self, items: Vec<T>, index: Option<usize>) {
        if items.is_empty() {
            return;
        }
        let index = index.unwrap_or(self.data.len());
        for (offset, item) in items.iter().enumerate() {
            self.data.insert(index + offset, item.clone());
        }
        self.records.push(ListChange::AddRange { index, items });
    }

    pub fn insert(&mut self, index: usize, item: T) {
        self.data.insert(index, item.clone());
        self.records.push(ListChange::Add { index, item });
    }

    pub fn replace_at(&mut self, index: usize, new: T) {
        let previous = std::mem::replace(&mut self.data[index], new.clone());
        self.records.push(ListChange::Replace { index, current: new, previous });
    }

    /// Replaces the first item equal to `old` with `new`, if any.
    pub fn replace_item(&mut self, old: &T, new: T)
    where
        T: PartialEq,
    {
        if let Some(index) = self.data.iter().position(|candidate| candidate == old) {
            self.replace_at(index, new);
        }
    }

    pub fn remove_at(&mut self, index: usize) -> T {
        let item = self.data.remove(index);
        self.records.push(ListChange::Remove { index, item: item.clone() });
        item
    }

    /// Removes the first item equal to `item`, if any.
    pub fn remove(&mut self, item: &T)
    where
        T: PartialEq,
    {
        if let Some(index) = self.data.iter().position(|candidate| candidate == item) {
            self.remove_at(index);
        }
    }

    pub fn remove_range(&mut self, index: usize, count: usize) {
        if count == 0 {
            return;
        }
        let items: Vec<T> = self.data.drain(index..index + count).collect();
        self.records.push(ListChange::RemoveRange { index, items });
    }

    pub fn move_item(&mut self, from: usize, to: usize) {
        if from == to {
            return;
        }
        let item = self.data.remove(from);
        self.data.insert(to, item.clone());
        self.records.push(ListChange::Moved { previous_index: from, current_index: to, item });
    }

    pub fn clear(&mut self) {
        let items = std::mem::take(self.data);
        if !items.is_empty() {
            self.records.push(ListChange::Clear { items });
        }
    }

    pub fn refresh_at(&mut self, index: usize) {
        let item = self.data[index].clone();
        self.records.push(ListChange::Refresh { index, item });
    }

    /// Refreshes every item equal to `item`.
    pub fn refresh_item(&mut self, item: &T)
    where
        T: PartialEq,
    {
        let indices: Vec<usize> = self.data.iter().enumerate().filter(|(_, candidate)| *candidate == item).map(|(i, _)| i).collect();
        for index in indices {
            self.refresh_at(index);
        }
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.data.get(index)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }
}
