//! Fatal Error Handling
//!
//! Page table errors are never recovered from: a half-applied update leaves
//! translations the guest cannot repair. The table code returns every error
//! to its caller and this module is the one place that ends the domain.

use crate::hypervisor::Hypervisor;
use crate::mm::MmError;

/// Report `err` and ask the hypervisor to crash the domain.
pub fn terminate<H: Hypervisor + ?Sized>(hv: &H, err: MmError) -> ! {
    log::error!("!!! FATAL PAGE TABLE ERROR !!!");
    log::error!("MM: {}", err);
    hv.crash()
}

/// Unwrap a table operation's result, terminating the domain on error.
pub trait OrTerminate<T> {
    fn or_terminate<H: Hypervisor + ?Sized>(self, hv: &H) -> T;
}

impl<T> OrTerminate<T> for Result<T, MmError> {
    #[inline]
    fn or_terminate<H: Hypervisor + ?Sized>(self, hv: &H) -> T {
        match self {
            Ok(value) => value,
            Err(err) => terminate(hv, err),
        }
    }
}
