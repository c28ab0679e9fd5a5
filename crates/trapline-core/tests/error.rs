//! Tests for error handling

use trapline_core::code::Tier;
use trapline_core::error::{Result, TraplineError};
use trapline_core::types::{BytecodeOffset, FuncIndex, GlobalIndex, InstanceId};

#[test]
fn test_out_of_memory_display()
{
    let error = TraplineError::OutOfMemory {
        what: "creating a breakpoint site",
    };
    let message = format!("{error}");
    assert!(message.contains("Out of memory"));
    assert!(message.contains("breakpoint site"));
    assert!(error.is_resource_exhaustion());
    assert!(!error.is_contract_violation());
}

#[test]
fn test_lookup_errors_name_the_offset()
{
    let error = TraplineError::NoTrapSite(BytecodeOffset::new(0x2a));
    assert_eq!(format!("{error}"), "No trap site at bytecode offset 0x0000002a");

    let error = TraplineError::FuncIndexOutOfRange {
        index: FuncIndex(9),
        count: 3,
    };
    let message = format!("{error}");
    assert!(message.contains("func#9"));
    assert!(message.contains('3'));

    let error = TraplineError::GlobalIndexOutOfRange {
        index: GlobalIndex(4),
        count: 1,
    };
    assert!(format!("{error}").contains("global#4"));

    let error = TraplineError::InstanceMismatch {
        expected: InstanceId(7),
        found: InstanceId(8),
    };
    assert_eq!(format!("{error}"), "Instance instance#8 is not the debugged instance instance#7");
    assert!(!error.is_contract_violation());
}

#[test]
fn test_contract_violations()
{
    assert!(TraplineError::StepModeUnderflow(FuncIndex(1)).is_contract_violation());
    assert!(TraplineError::FrameTrapUnderflow.is_contract_violation());
    assert!(!TraplineError::DebugNotEnabled.is_contract_violation());
}

#[test]
fn test_tier_unavailable_display()
{
    let message = format!("{}", TraplineError::TierUnavailable(Tier::Optimized));
    assert!(message.contains("optimized"));
}

#[test]
fn test_code_shared_display()
{
    let message = format!("{}", TraplineError::CodeShared { holders: 2 });
    assert!(message.contains("shared with 2"));
}

#[test]
fn test_io_error_conversion()
{
    let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "module.wasm");
    let error: TraplineError = io_err.into();

    match error {
        TraplineError::Io(_) => {
            // Expected: io::Error should convert to Io variant
        }
        _ => panic!("Expected Io variant"),
    }
}

#[test]
fn test_result_type_alias()
{
    fn returns_result() -> Result<i32>
    {
        Ok(42)
    }

    assert_eq!(returns_result().unwrap(), 42);

    fn returns_error() -> Result<i32>
    {
        Err(TraplineError::DebugNotEnabled)
    }

    assert!(returns_error().is_err());
}
