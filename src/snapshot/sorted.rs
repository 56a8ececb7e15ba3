/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Binary search helpers over vectors kept sorted by a key.

use std::cmp::Ordering;

pub(crate) fn find_sorted<'a, T, K, F>(items: &'a [T], key: &K, key_fn: F) -> Option<usize>
where
    K: Ord + ?Sized,
    F: Fn(&T) -> &K,
{
    items.binary_search_by(|probe| key_fn(probe).cmp(key)).ok()
}

/// Insert `item` at its sorted position, replacing an existing item with the same key.
pub(crate) fn insert_sorted<T, K, F>(items: &mut Vec<T>, item: T, key_fn: F)
where
    K: Ord + ?Sized,
    F: Fn(&T) -> &K,
{
    match items.binary_search_by(|probe| key_fn(probe).cmp(key_fn(&item))) {
        Ok(i) => items[i] = item,
        Err(i) => items.insert(i, item),
    }
}

pub(crate) fn remove_sorted<T, K, F>(items: &mut Vec<T>, key: &K, key_fn: F) -> Option<T>
where
    K: Ord + ?Sized,
    F: Fn(&T) -> &K,
{
    match items.binary_search_by(|probe| key_fn(probe).cmp(key)) {
        Ok(i) => Some(items.remove(i)),
        Err(_) => None,
    }
}

/// Remove from sorted `items` every element that is also in sorted `remove`.
pub(crate) fn remove_common<T: Ord>(items: &mut Vec<T>, remove: &[T]) {
    let mut j = 0;
    items.retain(|item| {
        while j < remove.len() && remove[j].cmp(item) == Ordering::Less {
            j += 1;
        }
        !(j < remove.len() && remove[j] == *item)
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_find_remove() {
        let mut items: Vec<(u8, &str)> = Vec::new();
        insert_sorted(&mut items, (5, "five"), |item| &item.0);
        insert_sorted(&mut items, (1, "one"), |item| &item.0);
        insert_sorted(&mut items, (3, "three"), |item| &item.0);
        insert_sorted(&mut items, (3, "THREE"), |item| &item.0);
        assert_eq!(items, vec![(1, "one"), (3, "THREE"), (5, "five")]);

        assert_eq!(find_sorted(&items, &5, |item| &item.0), Some(2));
        assert_eq!(find_sorted(&items, &4, |item| &item.0), None);

        assert_eq!(remove_sorted(&mut items, &1, |item| &item.0), Some((1, "one")));
        assert_eq!(remove_sorted(&mut items, &1, |item| &item.0), None);
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn remove_common_elements() {
        let mut items = vec!["a", "b", "c", "d"];
        remove_common(&mut items, &["b", "d", "e"]);
        assert_eq!(items, vec!["a", "c"]);
    }
}
