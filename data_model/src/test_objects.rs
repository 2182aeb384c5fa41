pub mod tests {
    use crate::{
        ActualLrp,
        ActualLrpBuilder,
        ActualLrpInstanceKey,
        ActualLrpKey,
        ActualLrpNetInfo,
        ActualLrpState,
        CellCapacity,
        CellId,
        CellPresence,
        DesiredLrp,
        DesiredLrpBuilder,
        DesiredLrpResource,
        PortMapping,
        Presence,
        RunAction,
    };

    pub const TEST_DOMAIN: &str = "test-domain";
    pub const TEST_PROCESS_GUID: &str = "process-guid-a";
    pub const TEST_CELL: &str = "cell-a";

    pub fn mock_actual_lrp_key(process_guid: &str, index: u32) -> ActualLrpKey {
        ActualLrpKey::new(process_guid, index, TEST_DOMAIN)
    }

    /// Instance guids are derived from the cell so that two mocks on the same
    /// cell share an identity.
    pub fn mock_instance_key(cell_id: &str) -> ActualLrpInstanceKey {
        ActualLrpInstanceKey::new(&format!("instance-on-{cell_id}"), cell_id)
    }

    pub fn mock_net_info() -> ActualLrpNetInfo {
        ActualLrpNetInfo::new(
            "10.0.0.1",
            "192.168.0.7",
            vec![PortMapping {
                container_port: 8080,
                host_port: 61001,
            }],
        )
    }

    /// Builds a structurally valid record in the given state. Claimed,
    /// Running and Evacuating records are placed on `cell_id`.
    pub fn mock_actual_lrp(
        process_guid: &str,
        index: u32,
        state: ActualLrpState,
        cell_id: &str,
    ) -> ActualLrp {
        let mut builder = ActualLrpBuilder::default();
        builder
            .key(mock_actual_lrp_key(process_guid, index))
            .state(state)
            .since(1_000);
        match state {
            ActualLrpState::Claimed => {
                builder.instance_key(Some(mock_instance_key(cell_id)));
            }
            ActualLrpState::Running => {
                builder
                    .instance_key(Some(mock_instance_key(cell_id)))
                    .net_info(mock_net_info());
            }
            ActualLrpState::Crashed => {
                builder
                    .crash_count(1)
                    .crash_reason(Some("exit status 1".to_string()));
            }
            ActualLrpState::Unclaimed => {}
        }
        builder.build().unwrap()
    }

    pub fn mock_evacuating_lrp(process_guid: &str, index: u32, cell_id: &str) -> ActualLrp {
        let mut lrp = mock_actual_lrp(process_guid, index, ActualLrpState::Running, cell_id);
        lrp.presence = Presence::Evacuating;
        lrp
    }

    pub fn mock_desired_lrp(process_guid: &str, domain: &str, instances: u32) -> DesiredLrp {
        DesiredLrpBuilder::default()
            .process_guid(process_guid)
            .domain(domain)
            .log_guid("log-guid")
            .instances(instances)
            .root_fs("docker:///busybox")
            .resource(DesiredLrpResource {
                memory_mb: 256,
                disk_mb: 1024,
                max_pids: 100,
            })
            .action(RunAction {
                path: "/bin/server".to_string(),
                args: vec!["--port".to_string(), "8080".to_string()],
                user: "vcap".to_string(),
            })
            .ports(vec![8080])
            .created_at(1_000)
            .build()
            .unwrap()
    }

    pub fn mock_cell(cell_id: &str) -> CellPresence {
        CellPresence {
            cell_id: CellId::from(cell_id),
            rep_address: format!("http://{cell_id}.cells.internal:1800"),
            zone: "z1".to_string(),
            capacity: CellCapacity {
                memory_mb: 16 * 1024,
                disk_mb: 64 * 1024,
                containers: 250,
            },
        }
    }
}
