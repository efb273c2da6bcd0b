use crate::observer::Observer;

/// Forwards an event only when its value differs from the previous one.
///
/// The first value is always forwarded. Useful in front of binary inputs, to
/// turn a polled level into edge notifications.
#[derive(Debug)]
pub struct StateChangeFilter<T, O> {
    inner: O,
    last: Option<T>,
}

impl<T, O> StateChangeFilter<T, O>
where
    T: PartialEq + Clone,
    O: Observer<T>,
{
    pub fn new(inner: O) -> Self {
        Self { inner, last: None }
    }

    /// Starts as if `initial` had already been seen, so it is not forwarded.
    pub fn with_initial(inner: O, initial: T) -> Self {
        Self {
            inner,
            last: Some(initial),
        }
    }

    pub fn last(&self) -> Option<&T> {
        self.last.as_ref()
    }

    pub fn into_inner(self) -> O {
        self.inner
    }
}

impl<T, O> Observer<T> for StateChangeFilter<T, O>
where
    T: PartialEq + Clone + Send,
    O: Observer<T>,
{
    fn event(&mut self, value: &T) {
        let changed = self.last.as_ref() != Some(value);
        self.last = Some(value.clone());
        if changed {
            self.inner.event(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forwards_only_changes() {
        let mut forwarded = Vec::new();
        {
            let mut filter = StateChangeFilter::new(|v: &i32| forwarded.push(*v));
            for v in [1, 1, 2, 2, 2, 3, 1] {
                filter.event(&v);
            }
        }
        assert_eq!(forwarded, vec![1, 2, 3, 1]);
    }

    #[test]
    fn test_first_value_is_always_forwarded() {
        let mut forwarded = Vec::new();
        {
            let mut filter = StateChangeFilter::new(|v: &bool| forwarded.push(*v));
            assert!(filter.last().is_none());
            filter.event(&false);
            assert_eq!(filter.last(), Some(&false));
        }
        assert_eq!(forwarded, vec![false]);
    }

    #[test]
    fn test_initial_value_suppresses_first_duplicate() {
        let mut forwarded = Vec::new();
        {
            let mut filter = StateChangeFilter::with_initial(|v: &bool| forwarded.push(*v), false);
            filter.event(&false);
            filter.event(&true);
        }
        assert_eq!(forwarded, vec![true]);
    }
}
