// Machina - PC Machine Orchestrator
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

#[cfg(test)]
mod tests {
    use crate::bus::IoPortHandler;
    use crate::codec::{ReadLeExt, WriteLeExt};
    use crate::cpu::{Cr0, EFlags, Processor, ProcessorFault, ProcessorMode};
    use crate::dispatch::DispatchEnd;
    use crate::memory::{AddressSpace, ProgramImage};
    use crate::metrics::PerformanceMetrics;
    use crate::peripherals::keyboard::Keyboard;
    use crate::peripherals::network::NetworkCard;
    use crate::peripherals::pit::IntervalTimer;
    use crate::snapshot::{self, RestoreTable, SnapshotEntry, SnapshotError};
    use crate::wiring::{self, WiringError};
    use crate::{
        Component, ComponentRef, ComponentRegistry, ComponentType, Linkage, Machine,
        MachineState, Offer, SimResult, SimulationError,
    };
    use machina_config::{ExecutionBackend, MachineConfig, NetworkConfig};
    use std::cell::RefCell;
    use std::io::{Read, Write};
    use std::rc::Rc;
    use std::sync::Arc;

    // --- Wiring fixtures: Top needs a wired Middle, Middle needs a wired Leaf. ---

    #[derive(Debug, Default)]
    struct Leaf {
        value: u32,
    }

    impl Component for Leaf {
        fn reset(&mut self) {
            self.value = 0;
        }

        fn accept(&mut self, _offer: &Offer<'_>) {}

        fn is_wired(&self) -> bool {
            true
        }

        fn save_state(&self, out: &mut dyn Write) -> SimResult<()> {
            out.write_u32_le(self.value)?;
            Ok(())
        }

        fn load_state(&mut self, input: &mut dyn Read) -> SimResult<()> {
            self.value = input.read_u32_le()?;
            Ok(())
        }
    }

    impl ComponentType for Leaf {
        const TYPE_NAME: &'static str = "test.Leaf";
    }

    #[derive(Debug, Default)]
    struct Middle {
        leaf: Option<Rc<RefCell<Leaf>>>,
    }

    impl Component for Middle {
        fn reset(&mut self) {}

        fn accept(&mut self, offer: &Offer<'_>) {
            if let Some(leaf) = offer.get_ready::<Leaf>() {
                self.leaf = Some(leaf);
            }
        }

        fn is_wired(&self) -> bool {
            self.leaf.is_some()
        }

        fn save_state(&self, _out: &mut dyn Write) -> SimResult<()> {
            Ok(())
        }

        fn load_state(&mut self, _input: &mut dyn Read) -> SimResult<()> {
            Ok(())
        }
    }

    impl ComponentType for Middle {
        const TYPE_NAME: &'static str = "test.Middle";
    }

    #[derive(Debug, Default)]
    struct Top {
        middle: Option<Rc<RefCell<Middle>>>,
    }

    impl Component for Top {
        fn reset(&mut self) {}

        fn accept(&mut self, offer: &Offer<'_>) {
            if let Some(middle) = offer.get_ready::<Middle>() {
                self.middle = Some(middle);
            }
        }

        fn is_wired(&self) -> bool {
            self.middle.is_some()
        }

        fn save_state(&self, _out: &mut dyn Write) -> SimResult<()> {
            Ok(())
        }

        fn load_state(&mut self, _input: &mut dyn Read) -> SimResult<()> {
            Ok(())
        }
    }

    impl ComponentType for Top {
        const TYPE_NAME: &'static str = "test.Top";
    }

    /// Accepts any payload on save, rejects every load.
    #[derive(Debug, Default)]
    struct Fragile;

    impl Component for Fragile {
        fn reset(&mut self) {}

        fn accept(&mut self, _offer: &Offer<'_>) {}

        fn is_wired(&self) -> bool {
            true
        }

        fn save_state(&self, out: &mut dyn Write) -> SimResult<()> {
            out.write_u8(0xEE)?;
            Ok(())
        }

        fn load_state(&mut self, _input: &mut dyn Read) -> SimResult<()> {
            Err(SimulationError::CorruptState("fragile"))
        }
    }

    impl ComponentType for Fragile {
        const TYPE_NAME: &'static str = "test.Fragile";
    }

    fn round_of(report: &wiring::WiringReport, label: &str) -> u32 {
        report
            .wired_at
            .iter()
            .find(|(l, _)| l == label)
            .map(|(_, round)| *round)
            .unwrap()
    }

    #[test]
    fn test_wiring_three_round_scenario() {
        let leaf = ComponentRef::new(Leaf::default());
        let top = ComponentRef::new(Top::default());
        let middle = ComponentRef::new(Middle::default());
        let mut registry: ComponentRegistry =
            [leaf.clone(), top.clone(), middle.clone()].into_iter().collect();

        let report = wiring::wire(&mut registry, wiring::DEFAULT_MAX_ROUNDS).unwrap();
        assert_eq!(report.rounds, 3);
        assert_eq!(round_of(&report, "test.Leaf#0"), 1);
        assert_eq!(round_of(&report, "test.Middle#0"), 2);
        assert_eq!(round_of(&report, "test.Top#0"), 3);
        assert!(registry.all_wired());

        let top = top.downcast::<Top>().unwrap();
        let middle_rc = middle.downcast::<Middle>().unwrap();
        let top = top.borrow();
        assert!(Rc::ptr_eq(top.middle.as_ref().unwrap(), &middle_rc));
        let leaf_rc = leaf.downcast::<Leaf>().unwrap();
        assert!(Rc::ptr_eq(
            middle_rc.borrow().leaf.as_ref().unwrap(),
            &leaf_rc
        ));
    }

    #[test]
    fn test_wiring_is_order_independent() {
        let orders: [[usize; 3]; 6] = [
            [0, 1, 2],
            [0, 2, 1],
            [1, 0, 2],
            [1, 2, 0],
            [2, 0, 1],
            [2, 1, 0],
        ];
        for order in orders {
            let all = [
                ComponentRef::new(Leaf::default()),
                ComponentRef::new(Middle::default()),
                ComponentRef::new(Top::default()),
            ];
            let mut registry: ComponentRegistry =
                order.iter().map(|&i| all[i].clone()).collect();
            let report = wiring::wire(&mut registry, 100).unwrap();
            assert_eq!(report.rounds, 3, "order {:?}", order);
            assert_eq!(round_of(&report, "test.Leaf#0"), 1);
            assert_eq!(round_of(&report, "test.Middle#0"), 2);
            assert_eq!(round_of(&report, "test.Top#0"), 3);

            let leaf = all[0].downcast::<Leaf>().unwrap();
            let middle = all[1].downcast::<Middle>().unwrap();
            let top = all[2].downcast::<Top>().unwrap();
            assert!(Rc::ptr_eq(middle.borrow().leaf.as_ref().unwrap(), &leaf));
            assert!(Rc::ptr_eq(top.borrow().middle.as_ref().unwrap(), &middle));
        }
    }

    #[test]
    fn test_wiring_failure_names_unwired_components() {
        let mut registry: ComponentRegistry = [
            ComponentRef::new(Top::default()),
            ComponentRef::new(Middle::default()),
        ]
        .into_iter()
        .collect();

        let err = wiring::wire(&mut registry, 100).unwrap_err();
        let WiringError::Unconverged {
            linkage, unwired, ..
        } = err;
        assert_eq!(linkage, Linkage::Initialise);
        assert_eq!(unwired, vec!["test.Top#0".to_string(), "test.Middle#0".to_string()]);
        assert!(!registry.all_wired());
    }

    #[test]
    fn test_wiring_respects_round_bound() {
        let mut registry: ComponentRegistry = [
            ComponentRef::new(Leaf::default()),
            ComponentRef::new(Middle::default()),
            ComponentRef::new(Top::default()),
        ]
        .into_iter()
        .collect();

        let err = wiring::wire(&mut registry, 2).unwrap_err();
        assert_eq!(
            err,
            WiringError::Unconverged {
                linkage: Linkage::Initialise,
                rounds: 2,
                unwired: vec!["test.Top#0".to_string()],
            }
        );
    }

    #[test]
    fn test_relink_runs_its_own_pass() {
        let mut registry: ComponentRegistry = [
            ComponentRef::new(Top::default()),
            ComponentRef::new(Leaf::default()),
            ComponentRef::new(Middle::default()),
        ]
        .into_iter()
        .collect();
        wiring::wire(&mut registry, 100).unwrap();
        assert!(!registry.all_relinked());

        let report = wiring::relink(&mut registry, 100).unwrap();
        assert_eq!(report.linkage, Linkage::Relink);
        // Relinking re-offers from scratch, but every predicate already holds.
        assert_eq!(report.rounds, 1);
        assert!(registry.all_relinked());
    }

    #[test]
    fn test_registry_rejects_duplicate_instance() {
        let leaf = ComponentRef::new(Leaf::default());
        let mut registry = ComponentRegistry::new();
        assert!(registry.insert(leaf.clone()));
        assert!(!registry.insert(leaf));
        assert!(registry.insert(ComponentRef::new(Leaf::default())));
        assert_eq!(registry.len(), 2);
    }

    // --- Snapshot codec ---

    #[test]
    fn test_snapshot_labels_are_unique_per_type() {
        let mut registry = ComponentRegistry::new();
        registry.add(Leaf { value: 1 });
        registry.add(Middle::default());
        registry.add(Leaf { value: 2 });

        let mut buf = Vec::new();
        assert_eq!(snapshot::save(&registry, &mut buf).unwrap(), 3);
        let entries = snapshot::read_container(&mut buf.as_slice()).unwrap();
        let labels: Vec<&str> = entries.iter().map(|e| e.label.as_str()).collect();
        assert_eq!(labels, ["test.Leaf#0", "test.Middle#0", "test.Leaf#1"]);
        assert_eq!(entries[2].payload, 2u32.to_le_bytes());
    }

    fn test_config() -> MachineConfig {
        let mut config = MachineConfig::default();
        config.execution.interrupt_check_threshold = 10;
        config
    }

    fn boot(config: &MachineConfig, code: &[u8]) -> Machine {
        let mut machine = Machine::standard(config).unwrap();
        let mut image = ProgramImage::new(0x7C00);
        image.add_segment(0x7C00, code.to_vec());
        machine.load_image(&image).unwrap();
        machine
    }

    fn save(machine: &Machine) -> Vec<u8> {
        let mut buf = Vec::new();
        machine.save_snapshot(&mut buf).unwrap();
        buf
    }

    // mov ax, 0x1234; nop; nop; jmp -4
    const SPIN: &[u8] = &[0xB8, 0x34, 0x12, 0x90, 0x90, 0xEB, 0xFC];

    #[test]
    fn test_standard_machine_wires_in_four_rounds() {
        let machine = Machine::standard(&MachineConfig::default()).unwrap();
        // Keyboard waits for the processor, which waits for the timer, which waits for the PIC.
        assert_eq!(machine.wiring_rounds(), 4);
        assert!(machine.registry().all_wired());
    }

    #[test]
    fn test_snapshot_round_trip_resaves_identically() {
        let config = test_config();
        let mut original = boot(&config, SPIN);
        original.execute().unwrap();
        original
            .component::<Keyboard>()
            .unwrap()
            .borrow_mut()
            .key_pressed(0x1E);
        let bytes = save(&original);

        let mut restored = Machine::standard(&config).unwrap();
        let report = restored.load_snapshot(&mut bytes.as_slice()).unwrap();
        assert_eq!(report.restored.len(), restored.registry().len());
        assert!(report.skipped.is_empty());
        assert!(restored.registry().all_relinked());
        assert_eq!(save(&restored), bytes);

        // Both continue identically.
        original.execute().unwrap();
        restored.execute().unwrap();
        let a = original.processor().unwrap();
        let b = restored.processor().unwrap();
        assert_eq!(a.borrow().eip, b.borrow().eip);
        assert_eq!(a.borrow().eax, 0x1234);
        assert_eq!(b.borrow().eax, 0x1234);
    }

    #[test]
    fn test_restore_skips_unknown_types() {
        let config = test_config();
        let original = boot(&config, SPIN);
        let mut entries = snapshot::read_container(&mut save(&original).as_slice()).unwrap();
        entries.push(SnapshotEntry {
            label: "com.example.SoundCard#0".to_string(),
            payload: vec![1, 2, 3],
        });
        let mut buf = Vec::new();
        snapshot::write_container(&entries, &mut buf).unwrap();

        let mut restored = Machine::standard(&config).unwrap();
        let report = restored.load_snapshot(&mut buf.as_slice()).unwrap();
        assert_eq!(report.skipped, vec!["com.example.SoundCard#0".to_string()]);
        assert_eq!(restored.state(), MachineState::Ready);
    }

    #[test]
    fn test_restore_retains_components_without_entries() {
        let plain = boot(&test_config(), SPIN);
        let bytes = save(&plain);

        let mut config = test_config();
        config.devices.network = Some(NetworkConfig {
            io_base: 0x300,
            irq: 9,
            mac: None,
        });
        let mut with_nic = Machine::standard(&config).unwrap();
        let report = with_nic.load_snapshot(&mut bytes.as_slice()).unwrap();
        assert_eq!(report.retained, vec![NetworkCard::TYPE_NAME.to_string()]);
        // The retained card is still reachable through the port table.
        let labels = with_nic.registry().labels();
        assert_eq!(labels.last().unwrap(), "machina.peripherals.NetworkCard#0");
        with_nic.execute().unwrap();
    }

    #[test]
    fn test_failed_restore_rolls_back() {
        let config = test_config();
        let original = boot(&config, SPIN);
        let mut entries = snapshot::read_container(&mut save(&original).as_slice()).unwrap();
        let keyboard = entries
            .iter_mut()
            .find(|e| e.type_name() == Keyboard::TYPE_NAME)
            .unwrap();
        keyboard.payload.truncate(2);
        let mut buf = Vec::new();
        snapshot::write_container(&entries, &mut buf).unwrap();

        let mut target = Machine::standard(&config).unwrap();
        target.processor().unwrap().borrow_mut().eax = 0x55;
        let ports = target.component::<IoPortHandler>().unwrap();
        let claimed = ports.borrow().claimed_ports();
        let status = ports.borrow().read(0x64);
        assert_ne!(status, 0xFF);

        let err = target.load_snapshot(&mut buf.as_slice()).unwrap_err();
        assert!(matches!(err, SnapshotError::Restore { ref label, .. } if label.starts_with(Keyboard::TYPE_NAME)));
        // The processor entry was applied first and must have been put back.
        assert_eq!(target.processor().unwrap().borrow().eax, 0x55);
        assert_eq!(target.state(), MachineState::Ready);

        // Devices stay reachable through port I/O.
        assert_eq!(ports.borrow().claimed_ports(), claimed);
        assert_eq!(ports.borrow().read(0x64), status);
        let mut image = ProgramImage::new(0x7C00);
        // cli; in al, 0x64; hlt
        image.add_segment(0x7C00, vec![0xFA, 0xE4, 0x64, 0xF4]);
        target.load_image(&image).unwrap();
        target.execute().unwrap();
        assert_eq!(target.processor().unwrap().borrow().eax & 0xFF, u32::from(status));
    }

    #[test]
    fn test_restore_accepts_entries_in_any_order() {
        let config = test_config();
        let mut source = boot(&config, SPIN);
        source.execute().unwrap();
        source.processor().unwrap().borrow_mut().eax = 0x77;
        let mut entries = snapshot::read_container(&mut save(&source).as_slice()).unwrap();
        entries.reverse();
        let mut buf = Vec::new();
        snapshot::write_container(&entries, &mut buf).unwrap();

        let mut target = Machine::standard(&config).unwrap();
        let report = target.load_snapshot(&mut buf.as_slice()).unwrap();
        assert_eq!(report.restored.len(), entries.len());
        assert!(report.skipped.is_empty());
        assert!(report.retained.is_empty());
        assert!(target.registry().all_relinked());
        assert_eq!(target.processor().unwrap().borrow().eax, 0x77);
        let source_ports = source.component::<IoPortHandler>().unwrap();
        let target_ports = target.component::<IoPortHandler>().unwrap();
        assert_eq!(
            target_ports.borrow().claimed_ports(),
            source_ports.borrow().claimed_ports()
        );

        // Every component carries the same state, now saved in container order.
        let resaved = snapshot::read_container(&mut save(&target).as_slice()).unwrap();
        assert_eq!(resaved, entries);
    }

    fn fragile_machine() -> Machine {
        let mut registry = ComponentRegistry::new();
        registry.add(Processor::new());
        registry.add(AddressSpace::new(0x1_0000, 16));
        registry.add(IoPortHandler::new());
        registry.add(IntervalTimer::new());
        registry.add(crate::peripherals::pic::InterruptController::new());
        registry.add(Fragile);
        let config = MachineConfig::default();
        let mut machine = Machine::new(registry, &config.execution, &config.wiring).unwrap();
        machine.restore_table_mut().register::<Fragile>();
        machine
    }

    #[test]
    fn test_failed_rollback_invalidates_machine() {
        let source = fragile_machine();
        let bytes = save(&source);

        let mut target = fragile_machine();
        let err = target.load_snapshot(&mut bytes.as_slice()).unwrap_err();
        assert!(matches!(err, SnapshotError::RollbackFailed { .. }));
        assert_eq!(target.state(), MachineState::Invalid);
        assert!(matches!(
            target.execute(),
            Err(SimulationError::MachineInvalid)
        ));
    }

    #[test]
    fn test_restore_table_lists_shipped_types() {
        let table = RestoreTable::standard();
        assert!(table.contains(Processor::TYPE_NAME));
        assert!(table.contains(NetworkCard::TYPE_NAME));
        assert!(!table.contains(Leaf::TYPE_NAME));
    }

    // --- Dispatcher ---

    fn observed(machine: &mut Machine) -> Arc<PerformanceMetrics> {
        let metrics = Arc::new(PerformanceMetrics::new());
        machine.add_observer(metrics.clone());
        metrics
    }

    #[test]
    fn test_dispatcher_instruction_accounting() {
        // nop; nop; nop; jmp -5: four instructions per block.
        let mut machine = boot(&test_config(), &[0x90, 0x90, 0x90, 0xEB, 0xFB]);
        let metrics = observed(&mut machine);

        let retired = machine.execute().unwrap();
        assert_eq!(retired, 400);
        assert_eq!(metrics.get_instructions(), 400);
        assert_eq!(metrics.get_blocks(), 100);
        assert_eq!(machine.last_dispatch_end(), Some(DispatchEnd::BlockLimit));
    }

    #[test]
    fn test_interrupt_checks_are_bounded_by_threshold() {
        let mut machine = boot(&test_config(), &[0x90, 0x90, 0x90, 0xEB, 0xFB]);
        let metrics = observed(&mut machine);

        let retired = machine.execute().unwrap();
        let k = 10;
        let checks = metrics.get_interrupt_checks();
        assert!(checks >= 1);
        assert!(checks <= retired.div_ceil(k), "{} checks for {} instructions", checks, retired);
    }

    #[test]
    fn test_block_length_is_capped() {
        let mut config = test_config();
        config.execution.max_block_len = 3;
        config.execution.max_blocks_per_dispatch = 1;
        let mut machine = boot(&config, &[0x90; 16]);
        assert_eq!(machine.execute().unwrap(), 3);
    }

    #[test]
    fn test_mode_switch_ends_dispatch_and_changes_strategy() {
        // mov ax, 1; mov cr0, eax; nop; jmp -3
        let code = [0xB8, 0x01, 0x00, 0x0F, 0x22, 0xC0, 0x90, 0xEB, 0xFD];
        let mut machine = boot(&test_config(), &code);
        let metrics = observed(&mut machine);

        assert_eq!(machine.execute().unwrap(), 2);
        assert_eq!(
            machine.last_dispatch_end(),
            Some(DispatchEnd::ModeSwitch(ProcessorMode::Protected))
        );
        assert_eq!(metrics.get_dispatches(ProcessorMode::Real), 1);
        assert_eq!(metrics.get_dispatches(ProcessorMode::Protected), 0);

        let retired = machine.execute().unwrap();
        assert_eq!(retired, 200);
        assert_eq!(metrics.get_dispatches(ProcessorMode::Real), 1);
        assert_eq!(metrics.get_dispatches(ProcessorMode::Protected), 1);
        assert_eq!(metrics.get_mode_switches(), 1);
    }

    #[test]
    fn test_backends_agree() {
        // cli; mov ax, 5; dec ax; jnz -3; hlt
        let code = [0xFA, 0xB8, 0x05, 0x00, 0x48, 0x75, 0xFD, 0xF4];
        let mut results = Vec::new();
        for backend in [ExecutionBackend::Interpreter, ExecutionBackend::Compiled] {
            let mut config = test_config();
            config.execution.backend = backend;
            let mut machine = boot(&config, &code);
            let retired = machine.execute().unwrap();
            let cpu = machine.processor().unwrap();
            let cpu = cpu.borrow();
            results.push((retired, cpu.eip, cpu.eax, machine.is_stopped()));
        }
        assert_eq!(results[0], (13, 0x7C08, 0, true));
        assert_eq!(results[0], results[1]);
    }

    #[test]
    fn test_backends_agree_across_a20_toggle() {
        let mut results = Vec::new();
        for backend in [ExecutionBackend::Interpreter, ExecutionBackend::Compiled] {
            let mut config = test_config();
            config.memory = "2MiB".to_string();
            config.execution.backend = backend;
            config.execution.max_blocks_per_dispatch = 1;
            let mut machine = Machine::standard(&config).unwrap();
            // inc ax; jmp -3 above 1 MiB, dec ax; jmp -3 at its wrapped alias
            let mut image = ProgramImage::new(0x10_0010);
            image.add_segment(0x10_0010, vec![0x40, 0xEB, 0xFD]);
            image.add_segment(0x10, vec![0x48, 0xEB, 0xFD]);
            machine.load_image(&image).unwrap();

            machine.execute().unwrap();
            assert_eq!(machine.processor().unwrap().borrow().eax, 1, "{:?}", backend);

            machine.address_space().unwrap().borrow().a20_line().set(false);
            machine.execute().unwrap();
            results.push(machine.processor().unwrap().borrow().eax);
        }
        assert_eq!(results, [0, 0]);
    }

    #[test]
    fn test_compiled_backend_sees_self_modifying_code() {
        let mut config = test_config();
        config.execution.backend = ExecutionBackend::Compiled;
        config.execution.max_blocks_per_dispatch = 1;
        // inc ax; jmp -3
        let mut machine = boot(&config, &[0x40, 0xEB, 0xFD]);
        machine.execute().unwrap();
        assert_eq!(machine.processor().unwrap().borrow().eax, 1);

        // Patch INC into DEC behind the cache's back.
        machine
            .address_space()
            .unwrap()
            .borrow_mut()
            .memory_mut()
            .write_u8(0x7C00, 0x48)
            .unwrap();
        machine.execute().unwrap();
        assert_eq!(machine.processor().unwrap().borrow().eax, 0);
    }

    #[test]
    fn test_unhandled_fault_halts_guest() {
        let mut machine = boot(&test_config(), &[0x90, 0xFF]);
        let metrics = observed(&mut machine);

        assert_eq!(machine.execute().unwrap(), 1);
        assert_eq!(
            machine.last_dispatch_end(),
            Some(DispatchEnd::Fault(ProcessorFault::InvalidOpcode { opcode: 0xFF }))
        );
        assert_eq!(metrics.get_faults(), 1);
        let cpu = machine.processor().unwrap();
        assert!(cpu.borrow().is_halted());
        assert_eq!(cpu.borrow().fault_count(), 1);
    }

    #[test]
    fn test_timer_interrupt_reaches_real_mode_handler() {
        // sti; jmp $   IRQ0 handler at 0x600: cli; hlt
        let mut machine = boot(&test_config(), &[0xFB, 0xEB, 0xFE]);
        {
            let space = machine.address_space().unwrap();
            let mut space = space.borrow_mut();
            let mem = space.memory_mut();
            mem.write_u16(0x08 * 4, 0x0600).unwrap();
            mem.write_u16(0x08 * 4 + 2, 0x0000).unwrap();
            mem.write_bytes(0x600, &[0xFA, 0xF4]).unwrap();
        }
        let timer = machine.component::<IntervalTimer>().unwrap();
        timer.borrow_mut().set_reload(50);

        for _ in 0..5 {
            if machine.is_stopped() {
                break;
            }
            machine.execute().unwrap();
        }
        assert!(machine.is_stopped());
        assert_eq!(machine.processor().unwrap().borrow().eip, 0x602);
        assert!(timer.borrow().expirations() >= 1);
    }

    #[test]
    fn test_vm86_interrupt_delivery_is_a_mode_switch() {
        let mut machine = boot(&test_config(), &[0xEB, 0xFE]);
        {
            let space = machine.address_space().unwrap();
            let mut space = space.borrow_mut();
            let mem = space.memory_mut();
            let gate = 0x1000 + 8 * 8;
            mem.write_u16(gate, 0x2000).unwrap();
            mem.write_u8(gate + 5, 0x8E).unwrap();
            mem.write_bytes(0x2000, &[0xF4]).unwrap();
        }
        {
            let cpu = machine.processor().unwrap();
            let mut cpu = cpu.borrow_mut();
            cpu.cr0 = Cr0::PE | Cr0::ET;
            cpu.eflags = EFlags::RESERVED | EFlags::IF | EFlags::VM;
            cpu.esp = 0x9000;
            cpu.set_idt(0x1000, 0x7FF);
        }
        machine
            .component::<IntervalTimer>()
            .unwrap()
            .borrow_mut()
            .set_reload(5);
        let metrics = observed(&mut machine);

        machine.execute().unwrap();
        assert_eq!(
            machine.last_dispatch_end(),
            Some(DispatchEnd::ModeSwitch(ProcessorMode::Protected))
        );
        assert_eq!(metrics.get_dispatches(ProcessorMode::Virtual8086), 1);
        assert_eq!(machine.processor().unwrap().borrow().eip, 0x2000);
    }

    #[test]
    fn test_keyboard_controller_gates_a20() {
        // mov al, 0xDD; out 0x64, al; cli; hlt
        let mut machine = boot(&test_config(), &[0xB0, 0xDD, 0xE6, 0x64, 0xFA, 0xF4]);
        machine.execute().unwrap();
        let space = machine.address_space().unwrap();
        assert!(!space.borrow().memory().a20_enabled());
    }

    #[test]
    fn test_guest_reads_scancode() {
        // cli; in al, 0x60; hlt
        let mut machine = boot(&test_config(), &[0xFA, 0xE4, 0x60, 0xF4]);
        machine
            .component::<Keyboard>()
            .unwrap()
            .borrow_mut()
            .key_pressed(0x2C);
        machine.execute().unwrap();
        assert_eq!(machine.processor().unwrap().borrow().eax & 0xFF, 0x2C);
    }

    #[test]
    fn test_network_card_is_polled() {
        let mut config = test_config();
        config.devices.network = Some(NetworkConfig {
            io_base: 0x300,
            irq: 9,
            mac: Some("02:00:00:00:00:01".to_string()),
        });
        let mut machine = boot(&config, &[0xEB, 0xFE]);
        let card = machine.component::<NetworkCard>().unwrap();
        let host = card.borrow().host();
        assert!(host.send_frame(vec![0xAB; 60]));

        machine.execute().unwrap();
        assert_eq!(card.borrow().pending_frames(), 1);
        assert_eq!(card.borrow().mac(), [2, 0, 0, 0, 0, 1]);
    }
}
