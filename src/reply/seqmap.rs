use crate::resp::Frame;

/// Ordered key/value pairs, written as a flat multibulk.
///
/// Unlike a hash reply the insertion order is part of the contract, so a
/// client reading `k1 v1 k2 v2` back gets the pairs in the order the command
/// produced them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SeqMap {
    pairs: Vec<(String, Frame)>,
}

impl SeqMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<K: Into<String>>(&mut self, key: K, value: Frame) -> &mut Self {
        self.pairs.push((key.into(), value));
        self
    }

    pub fn with<K: Into<String>>(mut self, key: K, value: Frame) -> Self {
        self.push(key, value);
        self
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn pairs(&self) -> &[(String, Frame)] {
        &self.pairs
    }

    pub fn into_frame(self) -> Frame {
        Frame::array(
            self.pairs
                .into_iter()
                .flat_map(|(key, value)| [Frame::bulk(key), value])
                .collect(),
        )
    }

    /// Rebuild a map from a flat `key value ...` array.
    ///
    /// Returns `None` for anything that is not an even-length array with
    /// UTF-8 bulk keys.
    pub fn from_frame(frame: Frame) -> Option<SeqMap> {
        let Frame::Array(Some(items)) = frame else {
            return None;
        };
        if items.len() % 2 != 0 {
            return None;
        }

        let mut map = SeqMap::new();
        let mut items = items.into_iter();
        while let (Some(key), Some(value)) = (items.next(), items.next()) {
            let key = String::from_utf8(key.as_bulk()?.to_vec()).ok()?;
            map.push(key, value);
        }
        Some(map)
    }
}

impl FromIterator<(String, Frame)> for SeqMap {
    fn from_iter<I: IntoIterator<Item = (String, Frame)>>(iter: I) -> Self {
        Self {
            pairs: iter.into_iter().collect(),
        }
    }
}
