//! Dispatcher behavior against the in-memory flash emulator
//!
//! Exercises the full command surface over a loopback transport: span
//! validation, poll-resumed erase/read/scan, the write session with its
//! asynchronous page pipeline and bad-block recovery, and the A/B
//! firmware update.

use pageprog_device::{BootLayout, BootSelector, Dispatcher, ImageSlot, BBT_CAPACITY};
use pageprog_dummy::{LoopbackTransport, MemBootRecord, MemFlash, MemImageStore};
use pageprog_proto::command::{MAX_COMMAND_FRAME, MAX_DATA_LEN};
use pageprog_proto::response::ResponseDecoder;
use pageprog_proto::{
    ChipGeometry, Command, Configure, DataChunk, ErrorCode, FirmwareVersion, OpFlags, Response,
    Span,
};

type TestDispatcher = Dispatcher<MemFlash, MemBootRecord, MemImageStore>;

const CHIP_ID: [u8; 5] = [0xEF, 0xAA, 0x01, 0x02, 0x03];
const IMAGE_SIZE: u32 = 0x8000;

// 8 blocks of 4 pages
fn geom() -> ChipGeometry {
    ChipGeometry {
        page_size: 256,
        block_size: 1024,
        total_size: 8192,
        spare_size: 16,
        bad_block_mark_offset: 0,
    }
}

fn dispatcher(flash: MemFlash) -> TestDispatcher {
    let layout = BootLayout {
        image0_base: 0x1000,
        image1_base: 0x9000,
        image_size: IMAGE_SIZE,
    };
    Dispatcher::new(
        flash,
        BootSelector::new(MemBootRecord::new(0xFF), layout),
        MemImageStore::new(IMAGE_SIZE),
        FirmwareVersion {
            major: 1,
            minor: 2,
            patch: 3,
        },
    )
}

fn send(t: &mut LoopbackTransport, command: &Command) {
    let mut buf = [0u8; MAX_COMMAND_FRAME];
    let n = command.encode(&mut buf);
    t.push_rx(&buf[..n]);
}

/// Poll until the dispatcher goes quiet, decoding everything it sends
fn pump(d: &mut TestDispatcher, t: &mut LoopbackTransport) -> Vec<Response> {
    let mut out = Vec::new();
    let mut dec = ResponseDecoder::new();
    let mut quiet = 0;
    for _ in 0..10_000 {
        d.poll(t);
        let tx = t.take_tx();
        if tx.is_empty() && !t.rx_pending() {
            quiet += 1;
            if quiet > 64 {
                break;
            }
        } else {
            quiet = 0;
        }
        let mut off = 0;
        while off < tx.len() {
            off += dec.push(&tx[off..]);
            while let Some(r) = dec.next().unwrap() {
                out.push(r);
            }
        }
    }
    out
}

fn exec(d: &mut TestDispatcher, t: &mut LoopbackTransport, command: &Command) -> Vec<Response> {
    send(t, command);
    pump(d, t)
}

fn configure(d: &mut TestDispatcher, t: &mut LoopbackTransport) {
    let responses = exec(
        d,
        t,
        &Command::Configure(Configure {
            geometry: geom(),
            hal_config: heapless::Vec::new(),
        }),
    );
    assert_eq!(responses, [Response::Ok]);
}

fn chunk(bytes: &[u8]) -> DataChunk {
    let mut c = DataChunk::new();
    c.extend_from_slice(bytes).unwrap();
    c
}

/// Stream a write payload in maximum-size data frames
fn stream(d: &mut TestDispatcher, t: &mut LoopbackTransport, data: &[u8]) -> Vec<Response> {
    let mut out = Vec::new();
    for piece in data.chunks(MAX_DATA_LEN) {
        out.extend(exec(d, t, &Command::WriteData(chunk(piece))));
    }
    out
}

fn data_bytes(responses: &[Response]) -> Vec<u8> {
    responses
        .iter()
        .filter_map(|r| match r {
            Response::Data(d) => Some(d.as_slice()),
            _ => None,
        })
        .flatten()
        .copied()
        .collect()
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn span(addr: u32, len: u32, flags: OpFlags) -> Span {
    Span { addr, len, flags }
}

#[test]
fn identity_queries_work_unconfigured() {
    let mut d = dispatcher(MemFlash::new(CHIP_ID));
    let mut t = LoopbackTransport::new();

    let responses = exec(&mut d, &mut t, &Command::GetVersion);
    assert_eq!(
        responses,
        [Response::Data(chunk(&[1, 2, 3, 0])), Response::Ok]
    );

    assert_eq!(
        exec(&mut d, &mut t, &Command::ReadId),
        [Response::Error(ErrorCode::ChipNotConf)]
    );
}

#[test]
fn configure_then_read_id() {
    let mut d = dispatcher(MemFlash::new(CHIP_ID));
    let mut t = LoopbackTransport::new();
    configure(&mut d, &mut t);

    assert_eq!(
        exec(&mut d, &mut t, &Command::ReadId),
        [Response::Data(chunk(&CHIP_ID)), Response::Ok]
    );
}

#[test]
fn inconsistent_geometry_rejected() {
    let mut d = dispatcher(MemFlash::new(CHIP_ID));
    let mut t = LoopbackTransport::new();
    let mut g = geom();
    g.block_size = 100;
    let responses = exec(
        &mut d,
        &mut t,
        &Command::Configure(Configure {
            geometry: g,
            hal_config: heapless::Vec::new(),
        }),
    );
    assert_eq!(responses, [Response::Error(ErrorCode::LenInvalid)]);
}

#[test]
fn erase_partial_range_keeps_length_over_skipped_block() {
    let mut flash = MemFlash::new(CHIP_ID);
    flash.mark_factory_bad(4); // second block
    let mut d = dispatcher(flash);
    let mut t = LoopbackTransport::new();
    configure(&mut d, &mut t);

    // three blocks requested; the bad one is replaced further on, so
    // four block slots are visited
    let responses = exec(
        &mut d,
        &mut t,
        &Command::Erase(span(0, 3072, OpFlags::SKIP_BAD_BLOCK)),
    );
    assert_eq!(
        responses,
        [
            Response::Progress { bytes_done: 1024 },
            Response::BadBlockSkipped {
                addr: 1024,
                size: 1024
            },
            Response::Progress { bytes_done: 2048 },
            Response::Progress { bytes_done: 3072 },
            Response::Ok,
        ]
    );
}

#[test]
fn full_chip_erase_absorbs_skipped_block() {
    let mut flash = MemFlash::new(CHIP_ID);
    flash.mark_factory_bad(4);
    let mut d = dispatcher(flash);
    let mut t = LoopbackTransport::new();
    configure(&mut d, &mut t);

    let responses = exec(
        &mut d,
        &mut t,
        &Command::Erase(span(0, 8192, OpFlags::SKIP_BAD_BLOCK)),
    );
    // the skipped block counts toward completion
    let progress: Vec<u32> = responses
        .iter()
        .filter_map(|r| match r {
            Response::Progress { bytes_done } => Some(*bytes_done),
            _ => None,
        })
        .collect();
    assert_eq!(progress, [1024, 2048, 3072, 4096, 5120, 6144, 7168, 8192]);
    assert_eq!(
        responses
            .iter()
            .filter(|r| matches!(r, Response::BadBlockSkipped { .. }))
            .count(),
        1
    );
    assert_eq!(responses.last(), Some(&Response::Ok));
}

#[test]
fn erase_validation_errors() {
    let mut d = dispatcher(MemFlash::new(CHIP_ID));
    let mut t = LoopbackTransport::new();
    configure(&mut d, &mut t);

    for (sp, code) in [
        (span(512, 1024, OpFlags::empty()), ErrorCode::AddrNotAligned),
        (span(0, 512, OpFlags::empty()), ErrorCode::LenNotAligned),
        (span(7168, 2048, OpFlags::empty()), ErrorCode::AddrExceeded),
        (span(0, 0, OpFlags::empty()), ErrorCode::LenInvalid),
    ] {
        assert_eq!(
            exec(&mut d, &mut t, &Command::Erase(sp)),
            [Response::Error(code)],
            "span {:?}",
            sp
        );
    }
}

#[test]
fn write_then_read_round_trip() {
    let mut d = dispatcher(MemFlash::new(CHIP_ID));
    let mut t = LoopbackTransport::new();
    configure(&mut d, &mut t);

    let data = pattern(512);
    assert_eq!(
        exec(
            &mut d,
            &mut t,
            &Command::WriteStart(span(0, 512, OpFlags::empty()))
        ),
        [Response::Ok]
    );
    let acks = stream(&mut d, &mut t, &data);
    assert_eq!(
        acks,
        [
            Response::WriteAck { bytes_acked: 256 },
            Response::WriteAck { bytes_acked: 512 },
        ]
    );
    assert_eq!(
        exec(&mut d, &mut t, &Command::WriteEnd),
        [Response::Ok]
    );

    let responses = exec(
        &mut d,
        &mut t,
        &Command::Read(span(0, 512, OpFlags::empty())),
    );
    assert_eq!(data_bytes(&responses), data);
    assert_eq!(responses.last(), Some(&Response::Ok));
}

#[test]
fn two_page_write_on_large_nand_geometry() {
    let mut d = dispatcher(MemFlash::new(CHIP_ID));
    let mut t = LoopbackTransport::new();
    let responses = exec(
        &mut d,
        &mut t,
        &Command::Configure(Configure {
            geometry: ChipGeometry {
                page_size: 2048,
                block_size: 131072,
                total_size: 268435456,
                spare_size: 0,
                bad_block_mark_offset: 0,
            },
            hal_config: heapless::Vec::new(),
        }),
    );
    assert_eq!(responses, [Response::Ok]);

    let data = pattern(4096);
    exec(
        &mut d,
        &mut t,
        &Command::WriteStart(span(0, 4096, OpFlags::empty())),
    );
    assert_eq!(
        stream(&mut d, &mut t, &data),
        [
            Response::WriteAck { bytes_acked: 2048 },
            Response::WriteAck { bytes_acked: 4096 },
        ]
    );
    assert_eq!(exec(&mut d, &mut t, &Command::WriteEnd), [Response::Ok]);

    let responses = exec(
        &mut d,
        &mut t,
        &Command::Read(span(0, 4096, OpFlags::empty())),
    );
    assert_eq!(data_bytes(&responses), data);
    assert_eq!(responses.last(), Some(&Response::Ok));
}

#[test]
fn zero_length_write_is_trivially_ok() {
    let mut d = dispatcher(MemFlash::new(CHIP_ID));
    let mut t = LoopbackTransport::new();
    configure(&mut d, &mut t);

    assert_eq!(
        exec(
            &mut d,
            &mut t,
            &Command::WriteStart(span(0, 0, OpFlags::empty()))
        ),
        [Response::Ok]
    );
    assert_eq!(exec(&mut d, &mut t, &Command::WriteEnd), [Response::Ok]);
}

#[test]
fn partial_page_at_write_end_fails() {
    let mut d = dispatcher(MemFlash::new(CHIP_ID));
    let mut t = LoopbackTransport::new();
    configure(&mut d, &mut t);

    exec(
        &mut d,
        &mut t,
        &Command::WriteStart(span(0, 256, OpFlags::empty())),
    );
    assert_eq!(
        exec(&mut d, &mut t, &Command::WriteData(chunk(&[0xAA; 50]))),
        []
    );
    assert_eq!(
        exec(&mut d, &mut t, &Command::WriteEnd),
        [Response::Error(ErrorCode::NandWr)]
    );
    // the failed session is gone
    assert_eq!(
        exec(&mut d, &mut t, &Command::WriteEnd),
        [Response::Error(ErrorCode::CmdInvalid)]
    );
}

#[test]
fn write_beyond_declared_length_fails() {
    let mut d = dispatcher(MemFlash::new(CHIP_ID));
    let mut t = LoopbackTransport::new();
    configure(&mut d, &mut t);

    exec(
        &mut d,
        &mut t,
        &Command::WriteStart(span(0, 256, OpFlags::empty())),
    );
    let mut responses = stream(&mut d, &mut t, &pattern(310));
    assert_eq!(responses.pop(), Some(Response::Error(ErrorCode::LenExceeded)));
}

#[test]
fn failed_program_moves_to_next_block() {
    let mut flash = MemFlash::new(CHIP_ID);
    flash.fail_program_in_block(0);
    let mut d = dispatcher(flash);
    let mut t = LoopbackTransport::new();
    configure(&mut d, &mut t);

    let data = pattern(256);
    exec(
        &mut d,
        &mut t,
        &Command::WriteStart(span(0, 256, OpFlags::SKIP_BAD_BLOCK)),
    );
    assert_eq!(
        stream(&mut d, &mut t, &data),
        [Response::WriteAck { bytes_acked: 256 }]
    );
    // the failure surfaces at the close, after which the page data
    // lands in the next good block
    assert_eq!(
        exec(&mut d, &mut t, &Command::WriteEnd),
        [
            Response::BadBlock {
                addr: 0,
                size: 1024
            },
            Response::Ok,
        ]
    );
    assert_eq!(&d.hal().page_bytes(4)[..256], data.as_slice());
    assert!(d.bad_blocks().contains(0));
}

#[test]
fn busy_chip_is_drained_before_next_page() {
    let mut flash = MemFlash::new(CHIP_ID);
    flash.set_busy_cycles(5);
    let mut d = dispatcher(flash);
    let mut t = LoopbackTransport::new();
    configure(&mut d, &mut t);

    let data = pattern(1024);
    exec(
        &mut d,
        &mut t,
        &Command::WriteStart(span(0, 1024, OpFlags::empty())),
    );
    stream(&mut d, &mut t, &data);
    assert_eq!(exec(&mut d, &mut t, &Command::WriteEnd), [Response::Ok]);
    assert_eq!(d.hal().pages_programmed, 4);
    for page in 0..4 {
        assert_eq!(
            d.hal().page_bytes(page)[..256],
            data[page as usize * 256..][..256]
        );
    }
}

#[test]
fn write_over_skipped_block_remaps() {
    let mut flash = MemFlash::new(CHIP_ID);
    flash.mark_factory_bad(4);
    let mut d = dispatcher(flash);
    let mut t = LoopbackTransport::new();
    configure(&mut d, &mut t);

    // two blocks starting at the bad one's predecessor; pages for the
    // bad block land in block 2 instead
    let data = pattern(2048);
    exec(
        &mut d,
        &mut t,
        &Command::WriteStart(span(0, 2048, OpFlags::SKIP_BAD_BLOCK)),
    );
    let responses = stream(&mut d, &mut t, &data);
    assert!(responses.contains(&Response::BadBlockSkipped {
        addr: 1024,
        size: 1024
    }));
    assert_eq!(
        responses.last(),
        Some(&Response::WriteAck { bytes_acked: 2048 })
    );
    assert_eq!(exec(&mut d, &mut t, &Command::WriteEnd), [Response::Ok]);

    // block 0 then block 2
    assert_eq!(&d.hal().page_bytes(3)[..256], &data[768..1024]);
    assert_eq!(&d.hal().page_bytes(8)[..256], &data[1024..1280]);
}

#[test]
fn full_chip_write_absorbs_skipped_block() {
    let mut flash = MemFlash::new(CHIP_ID);
    flash.mark_factory_bad(4);
    let mut d = dispatcher(flash);
    let mut t = LoopbackTransport::new();
    configure(&mut d, &mut t);

    exec(
        &mut d,
        &mut t,
        &Command::WriteStart(span(0, 8192, OpFlags::SKIP_BAD_BLOCK)),
    );
    // the skipped block shrinks the expected stream by one block
    let data = pattern(8192 - 1024);
    let responses = stream(&mut d, &mut t, &data);
    assert_eq!(
        responses.last(),
        Some(&Response::WriteAck { bytes_acked: 7168 })
    );
    assert_eq!(exec(&mut d, &mut t, &Command::WriteEnd), [Response::Ok]);
}

#[test]
fn full_chip_write_absorbs_trailing_bad_block() {
    let mut flash = MemFlash::new(CHIP_ID);
    // last block of the chip
    flash.mark_factory_bad(28);
    let mut d = dispatcher(flash);
    let mut t = LoopbackTransport::new();
    configure(&mut d, &mut t);

    exec(
        &mut d,
        &mut t,
        &Command::WriteStart(span(0, 8192, OpFlags::SKIP_BAD_BLOCK)),
    );
    // everything up to the bad tail; the skip notification must arrive
    // before the final ack so the host stops streaming in time
    let data = pattern(8192 - 1024);
    let responses = stream(&mut d, &mut t, &data);
    assert_eq!(
        &responses[responses.len() - 2..],
        [
            Response::BadBlockSkipped {
                addr: 7168,
                size: 1024
            },
            Response::WriteAck { bytes_acked: 7168 },
        ]
    );
    assert_eq!(exec(&mut d, &mut t, &Command::WriteEnd), [Response::Ok]);
}

#[test]
fn write_start_on_bad_block_skips_before_first_page() {
    let mut flash = MemFlash::new(CHIP_ID);
    flash.mark_factory_bad(0);
    let mut d = dispatcher(flash);
    let mut t = LoopbackTransport::new();
    configure(&mut d, &mut t);

    // the skip is reported at start, before any data window opens
    assert_eq!(
        exec(
            &mut d,
            &mut t,
            &Command::WriteStart(span(0, 1024, OpFlags::SKIP_BAD_BLOCK)),
        ),
        [
            Response::Ok,
            Response::BadBlockSkipped {
                addr: 0,
                size: 1024
            },
        ]
    );
    let data = pattern(1024);
    let responses = stream(&mut d, &mut t, &data);
    assert_eq!(
        responses.last(),
        Some(&Response::WriteAck { bytes_acked: 1024 })
    );
    assert_eq!(exec(&mut d, &mut t, &Command::WriteEnd), [Response::Ok]);
    // data lands in the replacement block
    assert_eq!(&d.hal().page_bytes(4)[..256], &data[..256]);
}

#[test]
fn read_skips_bad_block_and_reads_replacement() {
    let mut flash = MemFlash::new(CHIP_ID);
    flash.mark_factory_bad(4);
    let mut d = dispatcher(flash);
    let mut t = LoopbackTransport::new();
    configure(&mut d, &mut t);

    let responses = exec(
        &mut d,
        &mut t,
        &Command::Read(span(0, 3072, OpFlags::SKIP_BAD_BLOCK)),
    );
    assert!(responses.contains(&Response::BadBlockSkipped {
        addr: 1024,
        size: 1024
    }));
    assert_eq!(data_bytes(&responses).len(), 3072);
    assert_eq!(responses.last(), Some(&Response::Ok));
}

#[test]
fn bad_block_scan_reports_factory_marks() {
    let mut flash = MemFlash::new(CHIP_ID);
    flash.mark_factory_bad(4);
    flash.mark_factory_bad(12);
    let mut d = dispatcher(flash);
    let mut t = LoopbackTransport::new();
    configure(&mut d, &mut t);

    let responses = exec(&mut d, &mut t, &Command::ReadBadBlocks);
    assert_eq!(
        responses,
        [
            Response::BadBlock {
                addr: 1024,
                size: 1024
            },
            Response::BadBlock {
                addr: 3072,
                size: 1024
            },
            Response::Ok,
        ]
    );
    assert_eq!(d.bad_blocks().len(), 2);
}

#[test]
fn unscannable_chip_replays_session_table() {
    let mut flash = MemFlash::new(CHIP_ID);
    flash.set_scannable(false);
    flash.fail_erase_of_block(4);
    let mut d = dispatcher(flash);
    let mut t = LoopbackTransport::new();
    configure(&mut d, &mut t);

    // the erase failure populates the table
    let responses = exec(
        &mut d,
        &mut t,
        &Command::Erase(span(0, 8192, OpFlags::SKIP_BAD_BLOCK)),
    );
    assert!(responses.contains(&Response::BadBlock {
        addr: 1024,
        size: 1024
    }));
    assert_eq!(responses.last(), Some(&Response::Ok));

    assert_eq!(
        exec(&mut d, &mut t, &Command::ReadBadBlocks),
        [
            Response::BadBlock {
                addr: 1024,
                size: 1024
            },
            Response::Ok,
        ]
    );
}

#[test]
fn firmware_update_switches_active_image() {
    let mut d = dispatcher(MemFlash::new(CHIP_ID));
    let mut t = LoopbackTransport::new();
    configure(&mut d, &mut t);

    assert_eq!(
        exec(&mut d, &mut t, &Command::GetActiveImage),
        [Response::Data(chunk(&[0])), Response::Ok]
    );

    assert_eq!(
        exec(
            &mut d,
            &mut t,
            &Command::FwUpdateStart {
                addr: 0,
                len: 2048
            }
        ),
        [Response::Ok]
    );

    let image = pattern(2048);
    let mut acks = Vec::new();
    for piece in image.chunks(MAX_DATA_LEN) {
        acks.extend(exec(&mut d, &mut t, &Command::FwUpdateData(chunk(piece))));
    }
    assert_eq!(
        acks,
        [
            Response::WriteAck { bytes_acked: 1024 },
            Response::WriteAck { bytes_acked: 2048 },
        ]
    );

    assert_eq!(exec(&mut d, &mut t, &Command::FwUpdateEnd), [Response::Ok]);
    assert_eq!(
        exec(&mut d, &mut t, &Command::GetActiveImage),
        [Response::Data(chunk(&[1])), Response::Ok]
    );
    assert_eq!(d.images().slot_bytes(ImageSlot::Image1)[..2048], image[..]);
    assert_eq!(d.images().erases, [ImageSlot::Image1]);
}

#[test]
fn data_without_open_session_rejected() {
    let mut d = dispatcher(MemFlash::new(CHIP_ID));
    let mut t = LoopbackTransport::new();
    configure(&mut d, &mut t);

    assert_eq!(
        exec(&mut d, &mut t, &Command::WriteData(chunk(&[1, 2, 3]))),
        [Response::Error(ErrorCode::CmdInvalid)]
    );
    assert_eq!(
        exec(&mut d, &mut t, &Command::FwUpdateData(chunk(&[1, 2, 3]))),
        [Response::Error(ErrorCode::CmdInvalid)]
    );
    assert_eq!(
        exec(&mut d, &mut t, &Command::FwUpdateEnd),
        [Response::Error(ErrorCode::CmdInvalid)]
    );
}

#[test]
fn bad_block_table_overflow_surfaces() {
    let mut flash = MemFlash::new(CHIP_ID);
    // 21 bad blocks against a 20-entry table
    for block in 1..=21u32 {
        flash.mark_factory_bad(block * 4);
    }
    let mut d = dispatcher(flash);
    let mut t = LoopbackTransport::new();

    let mut g = geom();
    g.total_size = 32768; // 32 blocks
    assert_eq!(
        exec(
            &mut d,
            &mut t,
            &Command::Configure(Configure {
                geometry: g,
                hal_config: heapless::Vec::new(),
            })
        ),
        [Response::Ok]
    );

    let responses = exec(
        &mut d,
        &mut t,
        &Command::Erase(span(0, 32768, OpFlags::SKIP_BAD_BLOCK)),
    );
    assert_eq!(
        responses.last(),
        Some(&Response::Error(ErrorCode::BbtOverflow))
    );
    assert_eq!(d.bad_blocks().len(), BBT_CAPACITY);
}

#[test]
fn commands_rejected_while_operation_pending() {
    let mut d = dispatcher(MemFlash::new(CHIP_ID));
    let mut t = LoopbackTransport::new();
    configure(&mut d, &mut t);

    send(&mut t, &Command::Erase(span(0, 1024, OpFlags::empty())));
    send(&mut t, &Command::Read(span(0, 256, OpFlags::empty())));
    let responses = pump(&mut d, &mut t);
    assert_eq!(
        responses,
        [
            Response::Error(ErrorCode::CmdInvalid),
            Response::Progress { bytes_done: 1024 },
            Response::Ok,
        ]
    );
}
