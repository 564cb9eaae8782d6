/// Device restart capability
///
/// On the device `restart` never returns. Test doubles return so the full
/// success path stays observable.
pub trait Restart {
    fn restart(&mut self);
}

impl<F: FnMut()> Restart for F {
    fn restart(&mut self) {
        self()
    }
}
