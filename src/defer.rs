/// Runs the wrapped closure when dropped, so counters such as `waits` and
/// `connecting` are restored on every exit path, cancellation included.
pub struct OnDrop<F: FnOnce()>(Option<F>);

impl<F: FnOnce()> OnDrop<F> {
    pub fn new(f: F) -> Self {
        Self(Some(f))
    }
}

impl<F: FnOnce()> Drop for OnDrop<F> {
    fn drop(&mut self) {
        if let Some(f) = self.0.take() {
            f()
        }
    }
}

macro_rules! defer {
    ($func:block) => {
        let _on_drop = $crate::defer::OnDrop::new(|| $func);
    };
    ($func:expr) => {
        let _on_drop = $crate::defer::OnDrop::new($func);
    };
}
