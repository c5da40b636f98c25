//! Pools of reusable working objects.

//------------ Pool ----------------------------------------------------------

/// A pool of objects that can be checked out and returned.
///
/// Objects handed out may carry state from a previous use. They must be
/// fully reset by whatever binds them to their new purpose.
#[derive(Debug)]
pub struct Pool<T> {
    /// The objects currently not in use.
    idle: Vec<T>,

    /// The number of objects ever created by the pool.
    created: usize,
}

impl<T> Default for Pool<T> {
    fn default() -> Self {
        Pool { idle: Vec::new(), created: 0 }
    }
}

impl<T: Default> Pool<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Checks out an object, creating a new one if none is idle.
    pub fn take(&mut self) -> T {
        match self.idle.pop() {
            Some(item) => item,
            None => {
                self.created += 1;
                T::default()
            }
        }
    }

    /// Returns an object to the pool.
    pub fn give(&mut self, item: T) {
        self.idle.push(item)
    }

    /// Returns the number of objects created so far.
    pub fn created(&self) -> usize {
        self.created
    }

    /// Returns the number of objects currently idle.
    pub fn idle(&self) -> usize {
        self.idle.len()
    }
}


//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn objects_are_recycled() {
        let mut pool = Pool::<Vec<u8>>::new();
        let mut first = pool.take();
        first.push(1);
        let second = pool.take();
        assert_eq!(pool.created(), 2);
        pool.give(first);
        pool.give(second);
        assert_eq!(pool.idle(), 2);

        pool.take();
        pool.take();
        pool.take();
        assert_eq!(pool.created(), 3);
        assert_eq!(pool.idle(), 0);
    }
}
