//! Cenários ponta a ponta do núcleo de consenso: mineração, gasto, resolução
//! de gasto duplo, reorganização e rollback de reorganização inválida

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::sleep;
use std::time::Duration;

use shared::codec;
use shared::{KeyPair, PublicKeyBytes};
use veil_core::{
    Block, BlockHeader, BlockStore, ChainManager, ChainParams, Chainstate, CompStore, Computation,
    DevBackend, FheComputation, GenesisParams, MemPool, SharedComputation, Transaction, Wallet,
};

const GENESIS_TIMESTAMP: u64 = 1_700_000_000;

struct Harness {
    chainstate: Arc<Chainstate>,
    block_store: Arc<BlockStore>,
    mem_pool: Arc<MemPool>,
    comp_store: Arc<CompStore>,
    wallet: Arc<Wallet>,
    stop_flag: Arc<AtomicBool>,
    manager: ChainManager,
    genesis_keys: KeyPair,
}

impl Harness {
    /// Rede de teste: recompensa 100, dificuldade 3, época longa o bastante
    /// para a dificuldade não mudar nos cenários
    fn new(tx_per_block: u64) -> Self {
        let genesis_keys = KeyPair::generate();
        let genesis =
            Block::genesis(&genesis_keys.public_key, 100, 3, GENESIS_TIMESTAMP).unwrap();

        let params = ChainParams {
            genesis: GenesisParams {
                public_key: genesis_keys.public_key,
                reward: 100,
                difficulty: 3,
                timestamp: GENESIS_TIMESTAMP,
                hash: genesis.hash().unwrap(),
            },
            blocks_per_epoch: 1000,
            seconds_per_block: 10,
            default_tx_per_block: tx_per_block,
        };

        let chainstate = Arc::new(Chainstate::new());
        let block_store = Arc::new(BlockStore::new());
        let mem_pool = Arc::new(MemPool::new());
        let comp_store = Arc::new(CompStore::new());
        let wallet = Arc::new(Wallet::new_random());
        let stop_flag = Arc::new(AtomicBool::new(false));

        let manager = ChainManager::new(
            params,
            Arc::clone(&chainstate),
            Arc::clone(&block_store),
            Arc::clone(&mem_pool),
            Arc::clone(&comp_store),
            Arc::clone(&stop_flag),
            Arc::clone(&wallet),
        )
        .unwrap();

        Self {
            chainstate,
            block_store,
            mem_pool,
            comp_store,
            wallet,
            stop_flag,
            manager,
            genesis_keys,
        }
    }

    /// Minera uma rodada e admite o bloco resultante na principal
    fn mine_and_accept(&self) -> Block {
        self.stop_flag.store(false, Ordering::SeqCst);
        self.manager.start_mining().unwrap();
        assert!(self.manager.have_mined_block(), "rodada não produziu bloco");

        let block = self.manager.get_mined_block().unwrap();
        assert!(self.manager.add_block(block.clone(), true).unwrap());
        block
    }

    fn amounts_for(&self, pubkey: &PublicKeyBytes) -> Vec<u64> {
        let mut amounts: Vec<u64> = self
            .chainstate
            .filter_by_pubkey(pubkey)
            .into_iter()
            .map(|(txid, vout)| self.chainstate.record(&txid, vout).unwrap().amount)
            .collect();
        amounts.sort_unstable();
        amounts
    }
}

/// Computação FHE com a profundidade desejada: produto de 2^depth fatores
fn computation(depth: u32, salt: u8) -> SharedComputation {
    let factors = 1usize << depth;
    let expression = vec!["0"; factors].join("*");
    let comp = FheComputation::new(
        Arc::new(DevBackend),
        expression,
        vec![vec![salt; 16]],
        b"client-key".to_vec(),
        b"eval-mult-key".to_vec(),
        GENESIS_TIMESTAMP,
    )
    .unwrap();
    Arc::new(Mutex::new(comp))
}

/// Monta um bloco válido com timestamp escolhido, vinculando e provando as
/// computações
fn build_block(
    prev: &BlockHeader,
    height: u32,
    coinbase_to: &PublicKeyBytes,
    coinbase_amount: u64,
    txs: Vec<Transaction>,
    comps: Vec<SharedComputation>,
    timestamp: u64,
) -> Block {
    let coinbase = Transaction::coinbase(coinbase_to, coinbase_amount, height);
    let mut transactions = vec![coinbase];
    transactions.extend(txs);

    let mut block = Block::new(prev.hash().unwrap(), 3, comps, transactions).unwrap();
    block.header.timestamp = timestamp;

    let preimage = block.header.serialize(false).unwrap();
    for (idx, comp) in block.header.computations.iter().enumerate() {
        let mut data = preimage.clone();
        codec::put_u64(&mut data, idx as u64);
        let mut guard = comp.lock().unwrap();
        guard.bind(&data).unwrap();
        guard.generate_proof().unwrap();
    }
    block
}

#[test]
fn scenario_empty_mempool_mine() {
    let h = Harness::new(16);

    // uma computação de profundidade 5 cobre a dificuldade 3
    assert!(h.comp_store.store_computation(computation(5, 1)));

    let block = h.mine_and_accept();

    assert_eq!(h.manager.current_height(), 1);
    assert_eq!(block.transactions.len(), 1);
    assert!(h.block_store.exists(&block.hash().unwrap()));

    // um único UTXO de 100 pertence ao minerador
    let mined = h.amounts_for(h.wallet.public_key());
    assert_eq!(mined, vec![100]);
    assert_eq!(h.wallet.balance(), 100);

    // gênese (3) + bloco 1 (3)
    assert_eq!(h.manager.total_difficulty(), 6);

    // a computação consumida saiu da loja
    assert!(h.comp_store.collect_computations(1).is_empty());
}

#[test]
fn scenario_single_spend() {
    let h = Harness::new(16);
    let recipient = KeyPair::generate();

    h.comp_store.store_computation(computation(5, 1));
    h.mine_and_accept();
    assert_eq!(h.wallet.balance(), 100);

    // A envia 40 a B com taxa 10
    let tx = h.wallet.new_transaction(&recipient.public_key, 40, 10).unwrap();
    assert!(h.manager.add_tx(tx).unwrap());
    assert_eq!(h.mem_pool.len(), 1);

    h.comp_store.store_computation(computation(5, 2));
    sleep(Duration::from_millis(1100));
    let block = h.mine_and_accept();

    assert_eq!(block.transactions.len(), 2);
    assert_eq!(h.manager.current_height(), 2);

    // coinbase do bloco 2: recompensa 100 (ainda sem halving) + taxa 10
    assert_eq!(block.transactions[0].outputs[0].amount, 110);

    // A: coinbase 110 e troco 50; B: 40
    assert_eq!(h.amounts_for(h.wallet.public_key()), vec![50, 110]);
    assert_eq!(h.amounts_for(&recipient.public_key), vec![40]);
    assert_eq!(h.wallet.balance(), 160);

    // a transação saiu do mempool ao entrar na cadeia
    assert!(h.mem_pool.is_empty());
}

#[test]
fn scenario_double_spend_resolution() {
    // um slot de transação por bloco: o minerador escolhe a de maior taxa
    let h = Harness::new(1);
    let b_keys = KeyPair::generate();
    let c_keys = KeyPair::generate();

    h.comp_store.store_computation(computation(5, 1));
    h.mine_and_accept();

    let a_coin = h.wallet.list_coins()[0];

    // dois gastos do mesmo UTXO
    let tx1 = h.wallet.new_transaction(&b_keys.public_key, 40, 5).unwrap();
    let tx2 = h.wallet.new_transaction(&c_keys.public_key, 40, 10).unwrap();
    assert!(h.manager.add_tx(tx1.clone()).unwrap());
    assert!(h.manager.add_tx(tx2.clone()).unwrap());
    assert_eq!(h.mem_pool.len(), 2);

    h.comp_store.store_computation(computation(5, 2));
    sleep(Duration::from_millis(1100));
    let block = h.mine_and_accept();

    // tx2 venceu pela taxa
    assert_eq!(block.transactions.len(), 2);
    assert_eq!(
        block.transactions[1].txid().unwrap(),
        tx2.txid().unwrap()
    );

    // a moeda de A foi gasta e tx1 foi expulsa como conflito
    assert!(!h.chainstate.exists(&a_coin.0, a_coin.1));
    assert!(!h.mem_pool.exists(&tx1.txid().unwrap()));
    assert!(h.mem_pool.is_empty());

    assert_eq!(h.amounts_for(&c_keys.public_key), vec![40]);
    assert!(h.amounts_for(&b_keys.public_key).is_empty());
}

#[test]
fn scenario_reorg() {
    let h = Harness::new(16);
    let rival = KeyPair::generate();
    let genesis_header = h.manager.get_header(0).unwrap();

    // principal: G, b1, b2 minerados por A
    let b1 = build_block(
        &genesis_header,
        1,
        h.wallet.public_key(),
        100,
        vec![],
        vec![computation(5, 1)],
        GENESIS_TIMESTAMP + 10,
    );
    assert!(h.manager.add_block(b1.clone(), false).unwrap());
    let b2 = build_block(
        &b1.header,
        2,
        h.wallet.public_key(),
        100,
        vec![],
        vec![computation(5, 2)],
        GENESIS_TIMESTAMP + 20,
    );
    assert!(h.manager.add_block(b2.clone(), false).unwrap());

    assert_eq!(h.manager.current_height(), 2);
    assert_eq!(h.manager.total_difficulty(), 9);
    assert_eq!(h.wallet.balance(), 200);

    // fork rival: b1', b2', b3' minerados por outra carteira
    let f1 = build_block(
        &genesis_header,
        1,
        &rival.public_key,
        100,
        vec![],
        vec![computation(5, 11)],
        GENESIS_TIMESTAMP + 11,
    );
    assert!(h.manager.add_block(f1.clone(), false).unwrap());
    assert_eq!(h.manager.fork_count(), 1);

    let f2 = build_block(
        &f1.header,
        2,
        &rival.public_key,
        100,
        vec![],
        vec![computation(5, 12)],
        GENESIS_TIMESTAMP + 21,
    );
    assert!(h.manager.add_block(f2.clone(), false).unwrap());
    // empate de dificuldade total: principal não muda
    assert_eq!(h.manager.current_height(), 2);

    let f3 = build_block(
        &f2.header,
        3,
        &rival.public_key,
        100,
        vec![],
        vec![computation(5, 13)],
        GENESIS_TIMESTAMP + 31,
    );
    assert!(h.manager.add_block(f3.clone(), false).unwrap());

    // o fork pesou mais: reorganização
    assert_eq!(h.manager.current_height(), 3);
    assert_eq!(h.manager.total_difficulty(), 12);
    assert_eq!(
        h.manager.head_header().hash().unwrap(),
        f3.hash().unwrap()
    );

    // encadeamento íntegro após a troca
    for i in 1..=3usize {
        let prev = h.manager.get_header(i - 1).unwrap();
        let curr = h.manager.get_header(i).unwrap();
        assert_eq!(curr.prev_hash, prev.hash().unwrap());
    }

    // o chainstate reflete o fork: três coinbases do rival, nada de A, e a
    // saída da gênese segue intacta
    assert_eq!(h.amounts_for(&rival.public_key), vec![100, 100, 100]);
    assert!(h.amounts_for(h.wallet.public_key()).is_empty());
    assert_eq!(h.amounts_for(&h.genesis_keys.public_key), vec![100]);
    assert_eq!(h.chainstate.spent_count(), 0);

    // a principal antiga virou fork encurtado (b1, b2)
    assert_eq!(h.manager.fork_count(), 1);

    // carteira de A re-escaneada contra a nova principal
    assert_eq!(h.wallet.balance(), 0);
}

#[test]
fn scenario_reorg_rollback_on_invalid_tail() {
    let h = Harness::new(16);
    let rival = KeyPair::generate();
    let intruder = KeyPair::generate();
    let genesis_header = h.manager.get_header(0).unwrap();

    let b1 = build_block(
        &genesis_header,
        1,
        h.wallet.public_key(),
        100,
        vec![],
        vec![computation(5, 1)],
        GENESIS_TIMESTAMP + 10,
    );
    assert!(h.manager.add_block(b1.clone(), false).unwrap());
    let b2 = build_block(
        &b1.header,
        2,
        h.wallet.public_key(),
        100,
        vec![],
        vec![computation(5, 2)],
        GENESIS_TIMESTAMP + 20,
    );
    assert!(h.manager.add_block(b2.clone(), false).unwrap());

    let before_height = h.manager.current_height();
    let before_difficulty = h.manager.total_difficulty();
    let before_head = h.manager.head_header().hash().unwrap();
    let before_utxos = h.chainstate.utxo_count();
    let before_amounts = h.amounts_for(h.wallet.public_key());

    let f1 = build_block(
        &genesis_header,
        1,
        &rival.public_key,
        100,
        vec![],
        vec![computation(5, 11)],
        GENESIS_TIMESTAMP + 11,
    );
    assert!(h.manager.add_block(f1.clone(), false).unwrap());
    let f2 = build_block(
        &f1.header,
        2,
        &rival.public_key,
        100,
        vec![],
        vec![computation(5, 12)],
        GENESIS_TIMESTAMP + 21,
    );
    assert!(h.manager.add_block(f2.clone(), false).unwrap());

    // b3' carrega uma transação com assinatura inválida: gasta a coinbase do
    // rival assinando com a chave errada
    let mut bad_input =
        veil_core::TransactionInput::new(f1.transactions[0].txid().unwrap(), 0);
    bad_input.set_utxo_info(100, rival.public_key);
    let mut bad_tx = Transaction::build_payment(
        vec![bad_input],
        &intruder.public_key,
        &intruder.public_key,
        90,
        10,
    )
    .unwrap();
    bad_tx.sign(&intruder.public_key, &intruder).unwrap();

    let f3 = build_block(
        &f2.header,
        3,
        &rival.public_key,
        100,
        vec![bad_tx],
        vec![computation(5, 13)],
        GENESIS_TIMESTAMP + 31,
    );

    // a validação de cabeçalho passa, a reorganização dispara e falha no
    // replay completo; a principal antiga volta exata
    assert!(h.manager.add_block(f3, false).unwrap());

    assert_eq!(h.manager.current_height(), before_height);
    assert_eq!(h.manager.total_difficulty(), before_difficulty);
    assert_eq!(h.manager.head_header().hash().unwrap(), before_head);
    assert_eq!(h.chainstate.utxo_count(), before_utxos);
    assert_eq!(h.amounts_for(h.wallet.public_key()), before_amounts);
    assert_eq!(h.wallet.balance(), 200);

    // o fork sobrevive encurtado, sem a cauda inválida
    assert_eq!(h.manager.fork_count(), 1);
}
