// Scoped Vulkan handles
//
// Multi-step creation (image -> memory -> bind -> view) wraps every handle as
// soon as it exists. An early `?` destroys what was built so far, in reverse
// order; `into_inner` hands ownership on once the whole sequence succeeded.

/// Handle plus the call that destroys it
pub struct Scoped<'a, T: Copy> {
    value: T,
    destroy: Option<Box<dyn FnOnce(T) + 'a>>,
}

impl<'a, T: Copy> Scoped<'a, T> {
    pub fn new(value: T, destroy: impl FnOnce(T) + 'a) -> Self {
        Self {
            value,
            destroy: Some(Box::new(destroy)),
        }
    }

    pub fn get(&self) -> T {
        self.value
    }

    /// Keep the handle alive past the scope
    pub fn into_inner(mut self) -> T {
        self.destroy = None;
        self.value
    }
}

impl<T: Copy> Drop for Scoped<'_, T> {
    fn drop(&mut self) {
        if let Some(destroy) = self.destroy.take() {
            destroy(self.value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn dropped_guards_destroy_in_reverse_order() {
        let destroyed = RefCell::new(Vec::new());
        {
            let _image = Scoped::new(1u64, |v| destroyed.borrow_mut().push(v));
            let _memory = Scoped::new(2u64, |v| destroyed.borrow_mut().push(v));
        }
        assert_eq!(*destroyed.borrow(), vec![2, 1]);
    }

    #[test]
    fn into_inner_disarms_the_guard() {
        let destroyed = RefCell::new(Vec::new());
        let kept = {
            let image = Scoped::new(7u64, |v| destroyed.borrow_mut().push(v));
            assert_eq!(image.get(), 7);
            image.into_inner()
        };
        assert_eq!(kept, 7);
        assert!(destroyed.borrow().is_empty());
    }

    #[test]
    fn failure_midway_releases_earlier_steps() {
        let destroyed = RefCell::new(Vec::new());
        let build = |bind_fails: bool| -> Result<u64, &'static str> {
            let image = Scoped::new(10u64, |v| destroyed.borrow_mut().push(v));
            let _memory = Scoped::new(20u64, |v| destroyed.borrow_mut().push(v));
            if bind_fails {
                return Err("bind failed");
            }
            Ok(image.into_inner())
        };
        assert!(build(true).is_err());
        assert_eq!(*destroyed.borrow(), vec![20, 10]);
    }

    #[test]
    fn optional_guard_unwinds_between_its_neighbours() {
        let destroyed = RefCell::new(Vec::new());
        let bootstrap = |validation: bool, fail_at: u64| -> Result<u64, u64> {
            let instance = Scoped::new(1u64, |v| destroyed.borrow_mut().push(v));
            let messenger =
                validation.then(|| Scoped::new(2u64, |v| destroyed.borrow_mut().push(v)));
            if fail_at == 3 {
                return Err(3);
            }
            let device = Scoped::new(3u64, |v| destroyed.borrow_mut().push(v));
            if fail_at == 4 {
                return Err(4);
            }
            device.into_inner();
            if let Some(guard) = messenger {
                guard.into_inner();
            }
            Ok(instance.into_inner())
        };

        assert_eq!(bootstrap(true, 4), Err(4));
        assert_eq!(*destroyed.borrow(), vec![3, 2, 1]);

        destroyed.borrow_mut().clear();
        assert_eq!(bootstrap(false, 3), Err(3));
        assert_eq!(*destroyed.borrow(), vec![1]);

        destroyed.borrow_mut().clear();
        assert_eq!(bootstrap(true, 0), Ok(1));
        assert!(destroyed.borrow().is_empty());
    }
}
