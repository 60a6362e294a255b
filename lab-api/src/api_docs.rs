use crate::routes::addresses::SeedRequest;
use lab_network::dns::PublishedRecord;
use lab_network::{RecordType, Zone};
use lab_orchestrator::{
    AddressState, CreateMachineRequest, IpAllocation, Machine, MachineState, NameRecord, Operation,
    OperationStatus, OperationType, RecordRequest, SeedReport,
};
use lab_provider::{MachineView, PowerState, Resources, VmSnapshot};
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::routes::health::health_check,
        crate::routes::health::readiness_check,
        crate::routes::machines::create_machine,
        crate::routes::machines::list_machines,
        crate::routes::machines::list_ledger,
        crate::routes::machines::get_machine,
        crate::routes::machines::delete_machine,
        crate::routes::machines::list_all_vms,
        crate::routes::records::list_records,
        crate::routes::records::create_record,
        crate::routes::records::update_record,
        crate::routes::records::delete_record,
        crate::routes::records::live_records,
        crate::routes::records::list_zones,
        crate::routes::addresses::list_addresses,
        crate::routes::addresses::seed_addresses,
        crate::routes::operations::list_operations,
        crate::routes::operations::get_operation,
    ),
    components(
        schemas(
            Machine,
            MachineState,
            CreateMachineRequest,
            Resources,
            MachineView,
            VmSnapshot,
            PowerState,
            NameRecord,
            RecordRequest,
            RecordType,
            PublishedRecord,
            Zone,
            IpAllocation,
            AddressState,
            SeedReport,
            SeedRequest,
            Operation,
            OperationStatus,
            OperationType
        )
    ),
    tags(
        (name = "lab-api", description = "Student virtual machine provisioning API")
    )
)]
pub struct ApiDoc;
