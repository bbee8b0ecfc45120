use mesh_pitfill::algs::communicator::{CommTag, Communicator, NoComm, RayonComm, Wait};

fn pair() -> (RayonComm, RayonComm) {
    let mut w = RayonComm::world(2);
    let c1 = w.pop().unwrap();
    let c0 = w.pop().unwrap();
    (c0, c1)
}

#[test]
fn rayon_round_trip() {
    let tag = CommTag::new(0x1000);
    let (c0, c1) = pair();

    let msg = b"hello";
    let _s = c0.isend(1, tag.as_u16(), msg);

    let mut buf = [0u8; 5];
    let h = c1.irecv(0, tag.as_u16(), &mut buf);
    let got = h.wait().unwrap();
    assert_eq!(&got, msg);
}

#[test]
fn rayon_fifo_order() {
    let tag = CommTag::new(0x1001);
    let (c0, c1) = pair();

    for i in 0..10u8 {
        let _ = c0.isend(1, tag.as_u16(), &[i]);
    }
    let mut out = Vec::new();
    for _ in 0..10 {
        let mut b = [0u8; 1];
        let h = c1.irecv(0, tag.as_u16(), &mut b);
        out.push(h.wait().unwrap()[0]);
    }
    assert_eq!(out, (0u8..10u8).collect::<Vec<_>>());
}

#[test]
fn truncation_is_ok() {
    let tag = CommTag::new(0x1002);
    let (c0, c1) = pair();

    let _ = c0.isend(1, tag.as_u16(), &[1, 2, 3, 4, 5, 6]);
    let mut b = [0u8; 4];
    let h = c1.irecv(0, tag.as_u16(), &mut b);
    assert_eq!(h.wait().unwrap(), vec![1, 2, 3, 4]);
}

#[test]
fn tags_and_worlds_do_not_mix() {
    let (a0, a1) = pair();
    let (b0, _b1) = pair();
    let tag = CommTag::new(0x2000);

    let _ = b0.isend(1, tag.as_u16(), &[9]);
    let _ = a0.isend(1, tag.offset(1).as_u16(), &[2]);
    let _ = a0.isend(1, tag.as_u16(), &[1]);

    let mut buf = [0u8; 1];
    assert_eq!(a1.irecv(0, tag.as_u16(), &mut buf).wait().unwrap(), vec![1]);
    assert_eq!(a1.irecv(0, tag.offset(1).as_u16(), &mut buf).wait().unwrap(), vec![2]);
}

#[test]
fn no_comm_is_nop() {
    let comm = NoComm;
    assert!(comm.is_no_comm());
    assert_eq!((comm.rank(), comm.size()), (0, 1));
    let mut buf = [0u8; 8];
    assert!(comm.irecv(0, 123, &mut buf).wait().is_none());
    assert!(comm.isend(0, 123, &[]).wait().is_none());
}
