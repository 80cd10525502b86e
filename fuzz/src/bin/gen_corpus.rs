//! Utility to create AFL fuzzing corpus data.
//!
//! Writes a handful of well-formed peer conversations, each starting with the
//! protocol header, into the `fuzz/corpus` directory.

use std::{fs, io, path::Path};

use amqp_engine::{
    Role,
    codec::{ControlMessage, Declare, Performative},
    preamble::AMQP_HEADER,
};
use test_util::{ScriptedPeer, frames};

const CORPUS_DIR: &str = "fuzz/corpus";

fn conversation(performatives: &[Performative]) -> Vec<u8> {
    let mut bytes = AMQP_HEADER.to_vec();
    for performative in performatives {
        bytes.extend_from_slice(&ScriptedPeer::frame(0, performative));
    }
    bytes
}

fn open_close() -> Vec<u8> { conversation(&[frames::open("corpus"), frames::close(None)]) }

fn sender_transfer() -> Vec<u8> {
    let mut bytes = conversation(&[
        frames::open("corpus"),
        frames::begin(Some(0)),
        frames::attach("orders", 0, Role::Sender),
    ]);
    let transfer = frames::transfer(0, 0, b"t0");
    bytes.extend_from_slice(&ScriptedPeer::transfer_frame(0, transfer, b"hello"));
    bytes.extend_from_slice(&ScriptedPeer::frame(0, &frames::detach(0, true)));
    bytes.extend_from_slice(&ScriptedPeer::frame(0, &frames::end()));
    bytes
}

fn receiver_flow() -> Vec<u8> {
    conversation(&[
        frames::open("corpus"),
        frames::begin(Some(0)),
        frames::attach("orders", 0, Role::Receiver),
        frames::credit(0, 0, 10),
    ])
}

fn declare() -> Vec<u8> {
    let mut bytes = conversation(&[
        frames::open("corpus"),
        frames::begin(None),
        frames::attach_controller("txn-ctl", 0),
    ]);
    let message = ControlMessage::Declare(Declare::default()).encode();
    bytes.extend_from_slice(&ScriptedPeer::transfer_frame(
        0,
        frames::transfer(0, 0, b"d0"),
        &message,
    ));
    bytes
}

fn main() -> io::Result<()> {
    fs::create_dir_all(CORPUS_DIR)?;
    let dir = Path::new(CORPUS_DIR);
    fs::write(dir.join("open_close.bin"), open_close())?;
    fs::write(dir.join("sender_transfer.bin"), sender_transfer())?;
    fs::write(dir.join("receiver_flow.bin"), receiver_flow())?;
    fs::write(dir.join("declare.bin"), declare())?;
    Ok(())
}
