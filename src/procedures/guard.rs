//! Scoped adapter acquisition.
//!
//! Hardware must be left in a clean state whatever the procedure body does. A
//! `Drop`-based guard cannot run the async teardown, so acquisition is expressed as a
//! function instead: [`with_live_adapter`] creates the adapter, runs the body, and
//! always destroys the adapter afterwards.
//!
//! | Body result       | Teardown result | Returned                        |
//! |-------------------|-----------------|---------------------------------|
//! | `Ok(v)`           | `Ok`            | `Ok(v)`                         |
//! | `Ok(_)`           | `Err(t)`        | `Err(t)`                        |
//! | `Err(e)`          | `Ok`            | `Err(e)`                        |
//! | `Err(e)`          | `Err(t)`        | `Err(Aggregate[e, t])`          |
//! | panic             | either          | panic resumes after teardown    |

use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tracing::{error, info_span, warn, Instrument};

use crate::error::{BspError, Result};
use crate::hardware::capabilities::{BusProvisioner, LiveAdapter};
use crate::topology::{AdapterSpec, FpgaSpec};

/// Create `adapter`, run `body` against the live busses, then destroy it.
///
/// Teardown also runs when creation itself failed, since the kernel may have
/// instantiated the aux device before rejecting the rest; destroy is idempotent so
/// this is harmless when nothing was created.
///
/// Everything, including the body, runs inside an `adapter` span.
pub async fn with_live_adapter<F, Fut, T>(
    provisioner: &dyn BusProvisioner,
    fpga: &FpgaSpec,
    adapter: &AdapterSpec,
    body: F,
) -> Result<T>
where
    F: FnOnce(LiveAdapter) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let span = info_span!("adapter", fpga = %fpga.name, aux = %adapter.aux_device);
    scoped(provisioner, fpga, adapter, body).instrument(span).await
}

async fn scoped<F, Fut, T>(
    provisioner: &dyn BusProvisioner,
    fpga: &FpgaSpec,
    adapter: &AdapterSpec,
    body: F,
) -> Result<T>
where
    F: FnOnce(LiveAdapter) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let aux = &adapter.aux_device;

    let live = match provisioner.create(fpga, adapter).await {
        Ok(live) => live,
        Err(create_err) => {
            return match provisioner.destroy(fpga, aux).await {
                Ok(()) => Err(create_err),
                Err(teardown_err) => {
                    warn!(fpga = %fpga.name, %aux, error = %teardown_err, "Cleanup after failed create also failed");
                    Err(create_err.combine(teardown_err))
                }
            };
        }
    };

    let outcome = AssertUnwindSafe(async move { body(live).await })
        .catch_unwind()
        .await;

    let teardown = provisioner.destroy(fpga, aux).await;

    match (outcome, teardown) {
        (Ok(result), Ok(())) => result,
        (Ok(Ok(_)), Err(teardown_err)) => Err(teardown_err),
        (Ok(Err(body_err)), Err(teardown_err)) => {
            error!(fpga = %fpga.name, %aux, error = %teardown_err, "Adapter teardown failed");
            Err(body_err.combine(teardown_err))
        }
        (Err(panic), teardown) => {
            if let Err(teardown_err) = teardown {
                error!(fpga = %fpga.name, %aux, error = %teardown_err, "Adapter teardown failed during panic");
            }
            std::panic::resume_unwind(panic)
        }
    }
}

/// Collect the result of one adapter's run into a running failure list.
pub(crate) fn record(failures: &mut Vec<BspError>, result: Result<()>) {
    if let Err(err) = result {
        failures.push(err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::capabilities::BusDescriptor;
    use crate::topology::AuxDevice;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        fail_create: bool,
        fail_destroy: bool,
        creates: AtomicUsize,
        destroys: AtomicUsize,
    }

    #[async_trait]
    impl BusProvisioner for Counting {
        async fn create(&self, _fpga: &FpgaSpec, adapter: &AdapterSpec) -> Result<LiveAdapter> {
            self.creates.fetch_add(1, Ordering::SeqCst);
            if self.fail_create {
                return Err(BspError::provision(
                    adapter.aux_device.to_string(),
                    "resource already bound",
                ));
            }
            Ok(LiveAdapter::from_busses(vec![BusDescriptor {
                bus_num: 10,
                name: "ch0".into(),
            }])
            .unwrap())
        }

        async fn destroy(&self, _fpga: &FpgaSpec, aux: &AuxDevice) -> Result<()> {
            self.destroys.fetch_add(1, Ordering::SeqCst);
            if self.fail_destroy {
                return Err(BspError::provision(aux.to_string(), "remove failed"));
            }
            Ok(())
        }
    }

    fn fpga() -> FpgaSpec {
        FpgaSpec {
            name: "iob".into(),
            vendor_id: "1d9b".into(),
            device_id: "0011".into(),
            sub_system_vendor_id: "10ee".into(),
            sub_system_device_id: "0007".into(),
            i2c_adapters: Vec::new(),
        }
    }

    fn adapter() -> AdapterSpec {
        toml::from_str("aux_device = { name = \"i2c_master\", i2c_info = { num_channels = 1 } }")
            .unwrap()
    }

    #[tokio::test]
    async fn test_success_tears_down() {
        let prov = Counting::default();
        let base = with_live_adapter(&prov, &fpga(), &adapter(), |live| async move {
            Ok(live.base_bus_num)
        })
        .await
        .unwrap();
        assert_eq!(base, 10);
        assert_eq!(prov.destroys.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_body_failure_still_tears_down() {
        let prov = Counting::default();
        let err = with_live_adapter(&prov, &fpga(), &adapter(), |_| async {
            Err::<(), _>(BspError::Task("body".into()))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, BspError::Task(_)));
        assert_eq!(prov.destroys.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_teardown_failure_is_aggregated_not_substituted() {
        let prov = Counting {
            fail_destroy: true,
            ..Default::default()
        };
        let err = with_live_adapter(&prov, &fpga(), &adapter(), |_| async {
            Err::<(), _>(BspError::Task("body".into()))
        })
        .await
        .unwrap_err();
        let failures = err.failures();
        assert_eq!(failures.len(), 2);
        assert!(matches!(failures[0], BspError::Task(_)));
        assert!(matches!(failures[1], BspError::Provision { .. }));
    }

    #[tokio::test]
    async fn test_create_failure_attempts_cleanup() {
        let prov = Counting {
            fail_create: true,
            ..Default::default()
        };
        let err = with_live_adapter(&prov, &fpga(), &adapter(), |_| async { Ok(()) })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("resource already bound"));
        assert_eq!(prov.destroys.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panic_tears_down_then_resumes() {
        let prov = std::sync::Arc::new(Counting::default());
        let inner = prov.clone();
        let joined = tokio::spawn(async move {
            with_live_adapter(inner.as_ref(), &fpga(), &adapter(), |_| async {
                if true {
                    panic!("body panicked");
                }
                Ok(())
            })
            .await
        })
        .await;

        assert!(joined.unwrap_err().is_panic());
        assert_eq!(prov.destroys.load(Ordering::SeqCst), 1);
    }
}
